//! Blocking-until-condition primitive for experiment scripts.
//!
//! A [`Wait`] polls a [`Quantity`] against a caller-supplied predicate on a
//! timer until the predicate holds, the timeout elapses, or an external stop
//! aborts it. Timeouts and aborts are expected outcomes, reported through
//! [`WaitResult`], not errors; only a predicate that fails to *evaluate*
//! becomes a [`RigError::Wait`].
//!
//! The poll interval is a lower bound on iteration spacing, not a guarantee;
//! scheduling jitter is acceptable. The loop never busy-spins and its
//! inter-poll sleep races the stop signal, so a stopped sequence gets out of
//! a long wait within one poll interval instead of after the full timeout.

use crate::error::{RigError, RigResult};
use crate::quantity::Quantity;
use crate::sequence::StopToken;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Outcome of a wait. Only `Satisfied` means the predicate held.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// The predicate evaluated true.
    Satisfied,
    /// The timeout elapsed before the predicate held.
    TimedOut,
    /// An external stop request ended the wait early.
    Aborted,
}

/// Poll/timeout settings for a wait, reusable across calls.
#[derive(Clone, Copy, Debug)]
pub struct Wait {
    poll_interval: Duration,
    timeout: Duration,
}

impl Wait {
    /// A wait polling every `poll_interval`, giving up after `timeout`.
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self { poll_interval, timeout }
    }

    /// Lower bound on iteration spacing.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Total time budget before `TimedOut`.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Poll until the predicate holds, with no external abort.
    pub async fn run<P>(&self, quantity: &Quantity, predicate: P) -> RigResult<WaitResult>
    where
        P: Fn(&[f64]) -> anyhow::Result<bool>,
    {
        self.poll(quantity, predicate, None).await
    }

    /// Poll until the predicate holds, aborting promptly on `stop`.
    ///
    /// The stop signal is checked at the top of every iteration and raced
    /// against the inter-poll sleep, so the wait returns `Aborted` within
    /// one poll interval of the request.
    pub async fn run_aborting<P>(
        &self,
        quantity: &Quantity,
        predicate: P,
        stop: &StopToken,
    ) -> RigResult<WaitResult>
    where
        P: Fn(&[f64]) -> anyhow::Result<bool>,
    {
        self.poll(quantity, predicate, Some(stop)).await
    }

    async fn poll<P>(
        &self,
        quantity: &Quantity,
        predicate: P,
        stop: Option<&StopToken>,
    ) -> RigResult<WaitResult>
    where
        P: Fn(&[f64]) -> anyhow::Result<bool>,
    {
        let deadline = Instant::now() + self.timeout;
        loop {
            if stop.map(StopToken::is_stopped).unwrap_or(false) {
                debug!(quantity = ?quantity, "wait aborted");
                return Ok(WaitResult::Aborted);
            }
            let values = quantity.read().await?;
            let satisfied =
                predicate(&values).map_err(|e| RigError::Wait(e.to_string()))?;
            if satisfied {
                return Ok(WaitResult::Satisfied);
            }
            if Instant::now() >= deadline {
                debug!(quantity = ?quantity, "wait timed out");
                return Ok(WaitResult::TimedOut);
            }
            match stop {
                Some(stop) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = stop.stopped() => {
                            debug!(quantity = ?quantity, "wait aborted during poll sleep");
                            return Ok(WaitResult::Aborted);
                        }
                    }
                }
                None => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }
}

/// Predicate: first column is at least `target`.
pub fn at_least(target: f64) -> impl Fn(&[f64]) -> anyhow::Result<bool> {
    move |values| {
        let first = values
            .first()
            .ok_or_else(|| anyhow::anyhow!("empty sample"))?;
        Ok(*first >= target)
    }
}

/// Predicate: first column is at most `target`.
pub fn at_most(target: f64) -> impl Fn(&[f64]) -> anyhow::Result<bool> {
    move |values| {
        let first = values
            .first()
            .ok_or_else(|| anyhow::anyhow!("empty sample"))?;
        Ok(*first <= target)
    }
}

/// Predicate: first column is within `tolerance` of `target`. The usual
/// settling check after moving a setpoint.
pub fn within(target: f64, tolerance: f64) -> impl Fn(&[f64]) -> anyhow::Result<bool> {
    move |values| {
        let first = values
            .first()
            .ok_or_else(|| anyhow::anyhow!("empty sample"))?;
        Ok((*first - target).abs() <= tolerance)
    }
}

/// Manual-confirmation collaborator ("swap the sample, then press enter").
///
/// Platform dialogs and terminal prompts both fit behind this; core wait
/// logic does not depend on any implementation of it.
#[async_trait]
pub trait Confirm: Send + Sync {
    /// Resolve once the operator has acknowledged `prompt`.
    async fn confirm(&self, prompt: &str) -> RigResult<()>;
}
