//! Pauseable, independently running experiment sequences.
//!
//! A [`Sequence`] wraps a user-authored script body — an ordinary async
//! block that reads quantities, waits on conditions and records lines — and
//! runs it in its own Tokio task so the invoking console stays responsive.
//! The console controls it through `start`/`pause`/`resume`/`stop` and
//! observes it through `status`.
//!
//! # State machine
//!
//! ```text
//! Created --start()--> Running
//! Running --pause()--> Paused
//! Paused  --resume()--> Running
//! Running/Paused --stop()--> Stopped   (cooperative; lands at next checkpoint)
//! Running --(body returns)--> Finished
//! Running --(body errors/panics)--> Failed
//! ```
//!
//! Pause is cooperative, not preemptive. Suspending arbitrary script code
//! mid-instruction while it might hold a connection lock is unsafe, so the
//! body polls [`SequenceContext::checkpoint`] at its loop boundaries (and
//! every wait iteration checkpoints automatically via
//! [`SequenceContext::wait_until`]). `pause()` flags; the body parks at its
//! next checkpoint until resumed or stopped. `stop()` flags; the next
//! checkpoint unwinds the body with [`Interrupted`], which the runner maps
//! to `Stopped`. An exchange already in flight always completes first.

use crate::error::{RigError, RigResult};
use crate::quantity::Quantity;
use crate::wait::{Wait, WaitResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

/// Lifecycle state of a sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceState {
    /// Constructed, not yet started.
    Created,
    /// Body is executing (or unwinding after a stop request).
    Running,
    /// Pause requested; body parks at its next checkpoint.
    Paused,
    /// Stop request observed; body unwound cooperatively.
    Stopped,
    /// Body returned normally.
    Finished,
    /// Body errored or panicked; see [`Sequence::status`] for the cause.
    Failed,
}

impl SequenceState {
    /// True for states the body may still be executing in.
    pub fn is_live(self) -> bool {
        matches!(self, SequenceState::Running | SequenceState::Paused)
    }
}

impl fmt::Display for SequenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SequenceState::Created => "created",
            SequenceState::Running => "running",
            SequenceState::Paused => "paused",
            SequenceState::Stopped => "stopped",
            SequenceState::Finished => "finished",
            SequenceState::Failed => "failed",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ControlRequest {
    Run,
    Pause,
    Stop,
}

/// Read side of a stop signal; cheap to clone into waits and tick loops.
#[derive(Clone)]
pub struct StopToken {
    control: watch::Receiver<ControlRequest>,
}

impl StopToken {
    /// True once a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        *self.control.borrow() == ControlRequest::Stop
    }

    /// Resolves when a stop is requested. A dropped controller counts as a
    /// stop: nothing can resume us once the handle is gone.
    pub async fn stopped(&self) {
        let mut control = self.control.clone();
        let _ = control
            .wait_for(|request| *request == ControlRequest::Stop)
            .await;
    }
}

/// Stand-alone stop control for waits running outside any sequence.
pub struct StopHandle {
    control: watch::Sender<ControlRequest>,
}

impl StopHandle {
    /// Request the associated waits to abort.
    pub fn stop(&self) {
        let _ = self.control.send(ControlRequest::Stop);
    }
}

/// A stop handle/token pair not tied to a sequence (console-level waits,
/// tests).
pub fn stop_channel() -> (StopHandle, StopToken) {
    let (tx, rx) = watch::channel(ControlRequest::Run);
    (StopHandle { control: tx }, StopToken { control: rx })
}

/// Marker error a checkpoint returns when a stop was requested.
///
/// Script bodies propagate it with `?`; the runner recognizes it anywhere in
/// the error chain and records the sequence as `Stopped` rather than
/// `Failed`.
#[derive(Debug, thiserror::Error)]
#[error("sequence stop requested")]
pub struct Interrupted;

/// Capabilities handed to a running script body.
pub struct SequenceContext {
    control: watch::Receiver<ControlRequest>,
    name: String,
}

impl SequenceContext {
    /// Cooperative pause/stop point.
    ///
    /// Returns immediately while the sequence runs; parks here while paused;
    /// errors with [`Interrupted`] once a stop is requested. Call it at every
    /// script-level loop boundary.
    pub async fn checkpoint(&mut self) -> anyhow::Result<()> {
        let request = *self.control.borrow();
        match request {
            ControlRequest::Run => Ok(()),
            ControlRequest::Stop => Err(Interrupted.into()),
            ControlRequest::Pause => {
                info!(sequence = %self.name, "parked at checkpoint");
                let resumed = self
                    .control
                    .wait_for(|request| *request != ControlRequest::Pause)
                    .await;
                match resumed {
                    Ok(request) if *request == ControlRequest::Run => {
                        info!(sequence = %self.name, "resumed from checkpoint");
                        Ok(())
                    }
                    _ => Err(Interrupted.into()),
                }
            }
        }
    }

    /// Sleep that keeps honoring pause and stop.
    ///
    /// Equivalent to a plain sleep with a checkpoint folded into every
    /// control change, so a stop lands promptly even mid-sleep.
    pub async fn sleep(&mut self, duration: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.checkpoint().await?;
            if Instant::now() >= deadline {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
                changed = self.control.changed() => {
                    if changed.is_err() {
                        return Err(Interrupted.into());
                    }
                    // Loop back; the checkpoint sorts out pause vs stop.
                }
            }
        }
    }

    /// Wait for a condition, checkpointing on every poll iteration.
    ///
    /// A pause parks the wait at the top of its loop; a stop makes it return
    /// [`WaitResult::Aborted`] within one poll interval rather than erroring,
    /// so scripts can distinguish "condition met" from "we are shutting
    /// down". The timeout clock keeps running while paused.
    pub async fn wait_until<P>(
        &mut self,
        quantity: &Quantity,
        predicate: P,
        wait: &Wait,
    ) -> RigResult<WaitResult>
    where
        P: Fn(&[f64]) -> anyhow::Result<bool>,
    {
        let deadline = Instant::now() + wait.timeout();
        loop {
            if self.checkpoint().await.is_err() {
                return Ok(WaitResult::Aborted);
            }
            let values = quantity.read().await?;
            let satisfied =
                predicate(&values).map_err(|e| RigError::Wait(e.to_string()))?;
            if satisfied {
                return Ok(WaitResult::Satisfied);
            }
            if Instant::now() >= deadline {
                return Ok(WaitResult::TimedOut);
            }
            tokio::select! {
                _ = tokio::time::sleep(wait.poll_interval()) => {}
                changed = self.control.changed() => {
                    if changed.is_err() {
                        return Ok(WaitResult::Aborted);
                    }
                    // Re-enter the loop; the checkpoint handles the request.
                }
            }
        }
    }

    /// Stop signal view for hand-rolled loops and [`Wait::run_aborting`].
    pub fn stop_token(&self) -> StopToken {
        StopToken {
            control: self.control.clone(),
        }
    }
}

type ScriptFn = Box<dyn FnOnce(SequenceContext) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct Inner {
    state: SequenceState,
    error: Option<String>,
}

/// Snapshot of a sequence for the console.
#[derive(Clone, Debug)]
pub struct SequenceStatus {
    /// Sequence name.
    pub name: String,
    /// Lifecycle state at snapshot time.
    pub state: SequenceState,
    /// Failure cause, once `Failed`.
    pub error: Option<String>,
}

impl fmt::Display for SequenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(error) => write!(f, "{}: {} ({error})", self.name, self.state),
            None => write!(f, "{}: {}", self.name, self.state),
        }
    }
}

/// A user script plus the controls to run, pause and observe it.
pub struct Sequence {
    name: String,
    id: Uuid,
    inner: Arc<Mutex<Inner>>,
    control: watch::Sender<ControlRequest>,
    body: Mutex<Option<ScriptFn>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Sequence {
    /// Wrap a script body. Nothing runs until [`start`](Self::start).
    pub fn new<F, Fut>(name: &str, body: F) -> Self
    where
        F: FnOnce(SequenceContext) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (control, _) = watch::channel(ControlRequest::Run);
        Self {
            name: name.to_string(),
            id: Uuid::new_v4(),
            inner: Arc::new(Mutex::new(Inner {
                state: SequenceState::Created,
                error: None,
            })),
            control,
            body: Mutex::new(Some(Box::new(move |ctx| body(ctx).boxed()))),
            handle: Mutex::new(None),
        }
    }

    /// Sequence name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the body on its own task. `Created → Running` only.
    pub fn start(&self) -> RigResult<()> {
        let mut inner = self.lock();
        if inner.state != SequenceState::Created {
            return Err(RigError::InvalidTransition {
                operation: "start",
                state: inner.state,
            });
        }
        let body = self
            .body
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(RigError::InvalidTransition {
                operation: "start",
                state: inner.state,
            })?;
        inner.state = SequenceState::Running;
        drop(inner);
        info!(sequence = %self.name, id = %self.id, "sequence started");

        let ctx = SequenceContext {
            control: self.control.subscribe(),
            name: self.name.clone(),
        };
        let control = self.control.subscribe();
        let shared = self.inner.clone();
        let name = self.name.clone();
        let task = tokio::spawn(async move {
            let outcome = std::panic::AssertUnwindSafe(body(ctx)).catch_unwind().await;
            let mut inner = shared.lock().unwrap_or_else(PoisonError::into_inner);
            match outcome {
                Ok(Ok(())) => {
                    if *control.borrow() == ControlRequest::Stop {
                        inner.state = SequenceState::Stopped;
                        info!(sequence = %name, "sequence stopped");
                    } else {
                        inner.state = SequenceState::Finished;
                        info!(sequence = %name, "sequence finished");
                    }
                }
                Ok(Err(e)) => {
                    if e.chain().any(|cause| cause.downcast_ref::<Interrupted>().is_some()) {
                        inner.state = SequenceState::Stopped;
                        info!(sequence = %name, "sequence stopped");
                    } else {
                        let cause = format!("{e:#}");
                        error!(sequence = %name, error = %cause, "sequence failed");
                        inner.error = Some(cause);
                        inner.state = SequenceState::Failed;
                    }
                }
                Err(panic) => {
                    let cause = format!("script panicked: {}", panic_message(&panic));
                    error!(sequence = %name, error = %cause, "sequence failed");
                    inner.error = Some(cause);
                    inner.state = SequenceState::Failed;
                }
            }
        });
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(())
    }

    /// Request a pause. `Running → Paused` only; the body parks at its next
    /// checkpoint.
    pub fn pause(&self) -> RigResult<()> {
        let mut inner = self.lock();
        // A stop already in flight wins over a late pause.
        if inner.state != SequenceState::Running || *self.control.borrow() == ControlRequest::Stop {
            return Err(RigError::InvalidTransition {
                operation: "pause",
                state: inner.state,
            });
        }
        let _ = self.control.send(ControlRequest::Pause);
        inner.state = SequenceState::Paused;
        info!(sequence = %self.name, "pause requested");
        Ok(())
    }

    /// Clear a pause. `Paused → Running` only.
    pub fn resume(&self) -> RigResult<()> {
        let mut inner = self.lock();
        // A stop already in flight wins over a late resume.
        if inner.state != SequenceState::Paused || *self.control.borrow() == ControlRequest::Stop {
            return Err(RigError::InvalidTransition {
                operation: "resume",
                state: inner.state,
            });
        }
        let _ = self.control.send(ControlRequest::Run);
        inner.state = SequenceState::Running;
        info!(sequence = %self.name, "resume requested");
        Ok(())
    }

    /// Request cooperative termination from `Running` or `Paused`.
    ///
    /// Returns once the request is flagged; the state becomes `Stopped` when
    /// the body unwinds at its next checkpoint (a wait in progress aborts
    /// within one poll interval). Use [`join`](Self::join) to await that.
    pub fn stop(&self) -> RigResult<()> {
        let inner = self.lock();
        if !inner.state.is_live() {
            return Err(RigError::InvalidTransition {
                operation: "stop",
                state: inner.state,
            });
        }
        let _ = self.control.send(ControlRequest::Stop);
        info!(sequence = %self.name, "stop requested");
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SequenceState {
        self.lock().state
    }

    /// Snapshot for the console, failure cause included.
    pub fn status(&self) -> SequenceStatus {
        let inner = self.lock();
        SequenceStatus {
            name: self.name.clone(),
            state: inner.state,
            error: inner.error.clone(),
        }
    }

    /// Await the body's task and return the terminal status.
    pub async fn join(&self) -> SequenceStatus {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            // Panics are already contained by catch_unwind inside the task.
            let _ = handle.await;
        }
        self.status()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
