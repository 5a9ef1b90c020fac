//! Mock transports for tests and the demo rig.
//!
//! Two flavours:
//!
//! - [`MockTransport`]: a scripted command/response table plus an echo mode
//!   that tags every response with the request that produced it. The echo
//!   mode is what the exchange-serialization tests use to prove that no
//!   response is ever delivered to the wrong request.
//! - [`SimulatedInstrument`]: a register-file behind a SCPI-ish surface.
//!   Registers can ramp on every read (a warming cryostat, a settling
//!   motor) and can be linked to set commands, which is enough behaviour to
//!   drive quantities, waits and recorders end to end without hardware.

use super::{Transport, TransportError};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;

/// Scripted mock: a fixed command → response table, or echo mode.
pub struct MockTransport {
    responses: HashMap<String, String>,
    echo: bool,
    /// Upper bound for the random pause between write and read, echo mode.
    jitter: Duration,
    pending: Option<String>,
    closed: bool,
}

impl MockTransport {
    /// Create a mock that answers from a scripted table.
    pub fn new() -> Self {
        Self {
            responses: HashMap::new(),
            echo: false,
            jitter: Duration::ZERO,
            pending: None,
            closed: false,
        }
    }

    /// Create a mock whose every response is `echo:<request>`.
    ///
    /// With a non-zero `jitter`, a random pause is inserted between the write
    /// and the moment the response becomes available, widening the window in
    /// which an unserialized competitor could steal it.
    pub fn echo(jitter: Duration) -> Self {
        Self {
            responses: HashMap::new(),
            echo: true,
            jitter,
            pending: None,
            closed: false,
        }
    }

    /// Script a response for an exact command string.
    pub fn with_response(mut self, command: &str, response: &str) -> Self {
        self.responses.insert(command.to_string(), response.to_string());
        self
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&mut self, command: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.echo {
            if !self.jitter.is_zero() {
                let micros = rand::thread_rng().gen_range(0..self.jitter.as_micros() as u64);
                tokio::time::sleep(Duration::from_micros(micros)).await;
            }
            self.pending = Some(format!("echo:{command}"));
        } else {
            self.pending = self.responses.get(command).cloned();
        }
        Ok(())
    }

    async fn read(&mut self) -> Result<String, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.pending
            .take()
            .ok_or_else(|| TransportError::Read("no response pending".into()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }
}

struct Register {
    value: f64,
    step: f64,
}

/// A simulated device: identity string, register file, optional noise.
///
/// Queries ending in `?` read a register (and advance it by its step); a set
/// command `NAME value` writes the register linked to `NAME`. Unknown
/// commands produce no response, which the exchange layer reports as an I/O
/// error, the same way a real instrument goes silent on a bad command.
pub struct SimulatedInstrument {
    identity: String,
    registers: HashMap<String, Register>,
    setters: HashMap<String, String>,
    noise: f64,
    fail_reads: bool,
    pending: Option<String>,
    closed: bool,
}

impl SimulatedInstrument {
    /// New simulated device answering `*IDN?` with `identity`.
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            registers: HashMap::new(),
            setters: HashMap::new(),
            noise: 0.0,
            fail_reads: false,
            pending: None,
            closed: false,
        }
    }

    /// Add a register read by `query` (e.g. `"KELV?"`), starting at `initial`.
    pub fn with_register(self, query: &str, initial: f64) -> Self {
        self.with_ramping_register(query, initial, 0.0)
    }

    /// Add a register that advances by `step` after every read.
    pub fn with_ramping_register(mut self, query: &str, initial: f64, step: f64) -> Self {
        self.registers
            .insert(query.to_string(), Register { value: initial, step });
        self
    }

    /// Link set command `name` (e.g. `"SETP"`) to the register behind `query`.
    pub fn with_setter(mut self, name: &str, query: &str) -> Self {
        self.setters.insert(name.to_string(), query.to_string());
        self
    }

    /// Add uniform noise of the given amplitude to every register read.
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise = amplitude;
        self
    }

    /// Make every read fail, simulating a dead or unplugged device.
    ///
    /// The identity query still succeeds so that instrument construction
    /// passes and the failure lands mid-run, where the partial-failure
    /// policies are exercised.
    pub fn failing_after_connect(mut self) -> Self {
        self.fail_reads = true;
        self
    }
}

#[async_trait]
impl Transport for SimulatedInstrument {
    async fn write(&mut self, command: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let command = command.trim();
        if command == "*IDN?" {
            self.pending = Some(self.identity.clone());
            return Ok(());
        }
        if let Some(reg) = self.registers.get_mut(command) {
            let mut value = reg.value;
            reg.value += reg.step;
            if self.noise > 0.0 {
                value += rand::thread_rng().gen_range(-self.noise..self.noise);
            }
            self.pending = Some(format!("{value}"));
            return Ok(());
        }
        if let Some((name, arg)) = command.split_once(' ') {
            if let Some(query) = self.setters.get(name) {
                let parsed = arg
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| TransportError::Write(format!("bad set value '{arg}': {e}")))?;
                if let Some(reg) = self.registers.get_mut(query) {
                    reg.value = parsed;
                }
                self.pending = None;
                return Ok(());
            }
        }
        // Write-only commands (*RST, OUTX 0, ...) are accepted silently.
        self.pending = None;
        Ok(())
    }

    async fn read(&mut self) -> Result<String, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.fail_reads && self.pending.as_deref() != Some(self.identity.as_str()) {
            return Err(TransportError::Read("device not responding".into()));
        }
        self.pending
            .take()
            .ok_or_else(|| TransportError::Read("no response pending".into()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }
}
