//! Custom error types for the application.
//!
//! This module defines the primary error type, `RigError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures the rig can
//! produce, from registry misuse to transport faults during an exchange.
//!
//! ## Error Hierarchy
//!
//! `RigError` consolidates the failure modes of the core components:
//!
//! - **`NotFound` / `InUse`**: registry misuse. Releasing an address that was
//!   never acquired, or releasing one that instruments still reference. These
//!   are programming errors and are meant to be loud, not swallowed.
//! - **`InstrumentIo`**: the transport failed mid-exchange. Propagates to the
//!   immediate caller (a Quantity read or write); retry policy belongs to the
//!   caller's script, not to this crate.
//! - **`IdentificationMismatch`**: a connection opened fine but the device at
//!   the address identified as something else. Raised once, at instrument
//!   construction, before anything is driven.
//! - **`ReadOnly`**: write attempted on a quantity whose binding has no
//!   setter.
//! - **`Wait`**: a wait predicate failed to evaluate. Timeouts and aborts are
//!   *not* errors; they are [`WaitResult`](crate::wait::WaitResult) variants.
//! - **`RecorderClosed`** / **`InvalidTransition`**: lifecycle misuse of a
//!   recorder or sequence.
//!
//! With `#[from]` conversions for config and I/O errors, `?` works throughout
//! the crate.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type RigResult<T> = std::result::Result<T, RigError>;

/// Unified error type for the instrument rig.
#[derive(Error, Debug)]
pub enum RigError {
    /// No connection is registered under the given address.
    #[error("no connection registered for address '{0}'")]
    NotFound(String),

    /// The connection cannot be released while instruments still hold it.
    #[error("connection '{0}' is still referenced by {1} instrument(s)")]
    InUse(String, usize),

    /// The transport failed during a command/response exchange.
    #[error("instrument I/O failed on '{address}': {detail}")]
    InstrumentIo {
        /// Address of the connection the exchange was running on.
        address: String,
        /// Transport-level failure description.
        detail: String,
    },

    /// The device at the address is not the expected instrument type.
    #[error("wrong instrument at '{address}': expected identity starting with '{expected}', got '{got}'")]
    IdentificationMismatch {
        /// Address that was probed.
        address: String,
        /// First accepted identity prefix.
        expected: String,
        /// Identity string the device actually returned.
        got: String,
    },

    /// Write attempted on a quantity or property with no setter.
    #[error("'{0}' is read-only")]
    ReadOnly(String),

    /// Lookup of a property name the instrument never declared.
    #[error("instrument '{instrument}' has no property '{property}'")]
    UnknownProperty {
        /// Instrument kind.
        instrument: String,
        /// The property name that was requested.
        property: String,
    },

    /// A callable quantity source failed to produce a sample.
    #[error("quantity source error: {0}")]
    Source(String),

    /// A wait predicate failed to evaluate.
    #[error("wait predicate error: {0}")]
    Wait(String),

    /// The recorder was stopped; no further lines can be recorded.
    #[error("recorder is closed")]
    RecorderClosed,

    /// `start` called on an auto-recorder whose tick loop is already up.
    #[error("auto-recorder is already running")]
    RecorderRunning,

    /// A sequence control call that is illegal in the current state.
    #[error("cannot {operation} a sequence in state {state}")]
    InvalidTransition {
        /// The control operation that was attempted.
        operation: &'static str,
        /// The state the sequence was in at the time.
        state: crate::sequence::SequenceState,
    },

    /// A quantity binding's names/units/values have mismatched lengths.
    #[error("shape mismatch for quantity '{name}': {detail}")]
    Shape {
        /// Quantity display name.
        name: String,
        /// What did not line up.
        detail: String,
    },

    /// Configuration file or environment parsing error.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Semantic configuration error caught during validation.
    #[error("configuration validation error: {0}")]
    Configuration(String),

    /// File or terminal I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
