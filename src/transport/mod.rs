//! Transport abstraction for instrument I/O.
//!
//! A [`Transport`] is the low-level command/response channel to one physical
//! endpoint: a serial port, a GPIB adapter, a VISA session. The rest of the
//! crate never talks to hardware directly; it goes through this trait so that
//! tests and the demo rig can substitute the mock implementations in
//! [`mock`].
//!
//! Transports carry no locking of their own. Serialization of concurrent
//! callers happens one layer up, in [`Connection`](crate::registry::Connection),
//! which owns the transport behind its I/O mutex.

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

pub mod mock;

pub use mock::{MockTransport, SimulatedInstrument};

/// Failure at the transport layer.
///
/// The exchange layer wraps this as
/// [`RigError::InstrumentIo`](crate::error::RigError::InstrumentIo); scripts
/// normally never see a bare `TransportError`.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The endpoint could not be opened.
    #[error("failed to open '{0}': {1}")]
    Open(String, String),

    /// A write was not accepted by the endpoint.
    #[error("write failed: {0}")]
    Write(String),

    /// A read failed or timed out.
    #[error("read failed: {0}")]
    Read(String),

    /// The handle was closed or lost mid-session.
    #[error("transport closed")]
    Closed,
}

/// One open command/response channel to a physical endpoint.
///
/// Methods take `&mut self`: a transport is never shared directly, it is
/// owned by exactly one `Connection` and accessed under that connection's
/// lock.
#[async_trait]
pub trait Transport: Send {
    /// Write one command string to the device.
    async fn write(&mut self, command: &str) -> Result<(), TransportError>;

    /// Read one response line from the device.
    async fn read(&mut self) -> Result<String, TransportError>;

    /// Close the underlying handle. Further calls fail with
    /// [`TransportError::Closed`].
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Async factory invoked by the registry to open a transport for an address.
///
/// Boxed so that callers can hand in closures capturing their own state
/// (mock tables in tests, serial settings in a real deployment).
pub type TransportFactory = Box<
    dyn Fn(&str) -> BoxFuture<'static, Result<Box<dyn Transport>, TransportError>> + Send + Sync,
>;

/// Convenience for building a [`TransportFactory`] from an async closure.
pub fn factory<F, Fut>(f: F) -> TransportFactory
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Box<dyn Transport>, TransportError>> + Send + 'static,
{
    Box::new(move |address: &str| Box::pin(f(address.to_string())))
}
