//! Connection registry: one live connection per address, serialized exchanges.
//!
//! Every caller that asks for the same [`ConnectionAddress`] gets the same
//! [`Connection`], no matter which task it asks from. The registry's map lock
//! guards only lookup-or-insert (plus the transport open on first acquire);
//! instrument traffic never touches it, so unrelated instruments do not queue
//! behind registry housekeeping.
//!
//! The connection itself owns the only mandatory lock in the crate: a
//! `tokio::sync::Mutex` around the transport handle. One locked
//! write-command/read-response round trip is an *exchange*; exchanges on one
//! connection are strictly serialized, exchanges on different connections run
//! fully in parallel. Lock grant order is best-effort FIFO-ish, whatever the
//! mutex provides; callers must not rely on a stronger ordering.

use crate::error::{RigError, RigResult};
use crate::transport::{Transport, TransportFactory};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Minimum spacing between consecutive I/O operations on one connection.
///
/// Some bench instruments drop characters when commands arrive back to back;
/// 1 ms is the conservative default, override per registry if a device needs
/// more.
pub const DEFAULT_IO_HOLDOFF: Duration = Duration::from_millis(1);

/// Opaque, comparable identifier for one physical endpoint.
///
/// Resource strings are case-insensitive on every transport this crate has
/// met, so addresses normalize to upper case: `"asrl3::instr"` and
/// `"ASRL3::INSTR"` name the same connection.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionAddress(String);

impl ConnectionAddress {
    /// Normalize a resource string into an address.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_ascii_uppercase())
    }

    /// The normalized resource string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ConnectionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionAddress({})", self.0)
    }
}

impl From<&str> for ConnectionAddress {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

struct IoState {
    transport: Box<dyn Transport>,
    last_io: Instant,
}

/// One live transport plus the mutex that serializes access to it.
///
/// Owned by the registry as `Arc<Connection>`; instruments clone the `Arc`.
/// Several instruments may share one connection (channels of a mainframe);
/// they automatically share its lock.
pub struct Connection {
    address: ConnectionAddress,
    holdoff: Duration,
    io: Mutex<IoState>,
}

impl Connection {
    fn new(address: ConnectionAddress, transport: Box<dyn Transport>, holdoff: Duration) -> Self {
        Self {
            address,
            holdoff,
            io: Mutex::new(IoState {
                transport,
                last_io: Instant::now() - holdoff,
            }),
        }
    }

    /// Address this connection is bound to.
    pub fn address(&self) -> &ConnectionAddress {
        &self.address
    }

    fn io_error(&self, detail: impl fmt::Display) -> RigError {
        RigError::InstrumentIo {
            address: self.address.to_string(),
            detail: detail.to_string(),
        }
    }

    async fn pace(&self, io: &mut IoState) {
        let since = io.last_io.elapsed();
        if since < self.holdoff {
            tokio::time::sleep(self.holdoff - since).await;
        }
    }

    /// One exchange: lock, write `command`, read the response, unlock.
    ///
    /// The lock is released on every exit path; a transport error surfaces as
    /// [`RigError::InstrumentIo`] with the lock already dropped.
    pub async fn query(&self, command: &str) -> RigResult<String> {
        let mut io = self.io.lock().await;
        self.pace(&mut io).await;
        io.transport
            .write(command)
            .await
            .map_err(|e| self.io_error(e))?;
        let response = io.transport.read().await.map_err(|e| self.io_error(e))?;
        io.last_io = Instant::now();
        Ok(response.trim().to_string())
    }

    /// A write-only command (no response expected), under the same lock.
    pub async fn command(&self, command: &str) -> RigResult<()> {
        let mut io = self.io.lock().await;
        self.pace(&mut io).await;
        io.transport
            .write(command)
            .await
            .map_err(|e| self.io_error(e))?;
        io.last_io = Instant::now();
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connection({})", self.address)
    }
}

/// Process-scoped table of live connections, one per address.
///
/// Created explicitly at startup and passed by reference to everything that
/// connects; tests construct fresh registries, so there is no ambient global
/// to reset between them.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionAddress, Arc<Connection>>>,
    holdoff: Duration,
}

impl ConnectionRegistry {
    /// New empty registry with the default I/O hold-off.
    pub fn new() -> Self {
        Self::with_holdoff(DEFAULT_IO_HOLDOFF)
    }

    /// New empty registry whose connections pace I/O by `holdoff`.
    pub fn with_holdoff(holdoff: Duration) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            holdoff,
        }
    }

    /// Return the connection for `address`, opening it on first request.
    ///
    /// Lookup-or-insert is atomic across concurrent callers: the map lock is
    /// held through the factory call, so two tasks racing to connect to the
    /// same address get the same `Arc` and the factory runs exactly once.
    /// Only concurrent *connects* queue here; exchanges on established
    /// connections never take this lock.
    pub async fn acquire(
        &self,
        address: &ConnectionAddress,
        factory: &TransportFactory,
    ) -> RigResult<Arc<Connection>> {
        let mut connections = self.connections.lock().await;
        if let Some(existing) = connections.get(address) {
            debug!(%address, "reusing existing connection");
            return Ok(existing.clone());
        }
        let transport = factory(address.as_str()).await.map_err(|e| RigError::InstrumentIo {
            address: address.to_string(),
            detail: e.to_string(),
        })?;
        let connection = Arc::new(Connection::new(address.clone(), transport, self.holdoff));
        connections.insert(address.clone(), connection.clone());
        info!(%address, "connection opened");
        Ok(connection)
    }

    /// Close and remove the connection for `address`.
    ///
    /// Fails with [`RigError::NotFound`] if the address was never acquired
    /// and with [`RigError::InUse`] while instruments still hold the
    /// connection; releasing under a live instrument would leave its
    /// quantities dangling. With no holders left, any in-flight exchange is
    /// waited out (the I/O lock is taken) before the transport closes.
    pub async fn release(&self, address: &ConnectionAddress) -> RigResult<()> {
        let mut connections = self.connections.lock().await;
        let connection = connections
            .get(address)
            .ok_or_else(|| RigError::NotFound(address.to_string()))?;
        let holders = Arc::strong_count(connection) - 1;
        if holders > 0 {
            return Err(RigError::InUse(address.to_string(), holders));
        }
        let connection = connections
            .remove(address)
            .ok_or_else(|| RigError::NotFound(address.to_string()))?;
        let mut io = connection.io.lock().await;
        io.transport
            .close()
            .await
            .map_err(|e| RigError::InstrumentIo {
                address: address.to_string(),
                detail: e.to_string(),
            })?;
        info!(%address, "connection closed");
        Ok(())
    }

    /// Number of live connections.
    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// True when no connections are open.
    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    /// Best-effort teardown: close everything, logging what would not close.
    ///
    /// Connections still referenced by instruments are closed anyway; this
    /// runs at process shutdown where dangling accessors no longer matter.
    pub async fn shutdown(&self) {
        let mut connections = self.connections.lock().await;
        for (address, connection) in connections.drain() {
            let mut io = connection.io.lock().await;
            match io.transport.close().await {
                Ok(()) => info!(%address, "connection closed"),
                Err(e) => warn!(%address, error = %e, "transport did not close cleanly"),
            }
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{factory, MockTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo_factory(opened: Arc<AtomicUsize>) -> TransportFactory {
        factory(move |_address| {
            let opened = opened.clone();
            async move {
                opened.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(MockTransport::echo(Duration::from_micros(200)))
                    as Box<dyn crate::transport::Transport>)
            }
        })
    }

    #[tokio::test]
    async fn test_address_normalization() {
        assert_eq!(
            ConnectionAddress::new(" asrl3::instr "),
            ConnectionAddress::new("ASRL3::INSTR")
        );
    }

    #[tokio::test]
    async fn test_acquire_deduplicates_concurrent_callers() {
        let registry = Arc::new(ConnectionRegistry::new());
        let opened = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(echo_factory(opened.clone()));
        let address = ConnectionAddress::new("GPIB0::8::INSTR");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let factory = factory.clone();
            let address = address.clone();
            handles.push(tokio::spawn(async move {
                registry.acquire(&address, &factory).await.map(|c| Arc::as_ptr(&c) as usize)
            }));
        }
        let mut pointers = Vec::new();
        for handle in handles {
            pointers.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1, "factory must run exactly once");
        assert!(pointers.windows(2).all(|w| w[0] == w[1]), "all callers share one Connection");
    }

    #[tokio::test]
    async fn test_exchanges_never_cross_requests() {
        let registry = ConnectionRegistry::with_holdoff(Duration::ZERO);
        let factory = echo_factory(Arc::new(AtomicUsize::new(0)));
        let address = ConnectionAddress::new("ASRL1::INSTR");
        let connection = registry.acquire(&address, &factory).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..32 {
            let connection = connection.clone();
            handles.push(tokio::spawn(async move {
                let request = format!("REQ {i}");
                let response = connection.query(&request).await.unwrap();
                (request, response)
            }));
        }
        for handle in handles {
            let (request, response) = handle.await.unwrap();
            assert_eq!(response, format!("echo:{request}"), "torn exchange");
        }
    }

    #[tokio::test]
    async fn test_release_unknown_address() {
        let registry = ConnectionRegistry::new();
        let err = registry
            .release(&ConnectionAddress::new("ASRL9::INSTR"))
            .await
            .unwrap_err();
        assert!(matches!(err, RigError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_release_rejected_while_held() {
        let registry = ConnectionRegistry::new();
        let factory = echo_factory(Arc::new(AtomicUsize::new(0)));
        let address = ConnectionAddress::new("ASRL2::INSTR");
        let held = registry.acquire(&address, &factory).await.unwrap();

        let err = registry.release(&address).await.unwrap_err();
        assert!(matches!(err, RigError::InUse(_, 1)));

        drop(held);
        registry.release(&address).await.unwrap();
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_io_holdoff_spaces_exchanges() {
        let registry = ConnectionRegistry::with_holdoff(Duration::from_millis(5));
        let factory = echo_factory(Arc::new(AtomicUsize::new(0)));
        let address = ConnectionAddress::new("ASRL4::INSTR");
        let connection = registry.acquire(&address, &factory).await.unwrap();

        let start = Instant::now();
        connection.query("A").await.unwrap();
        connection.query("B").await.unwrap();
        connection.query("C").await.unwrap();
        // Second and third exchange each wait out the 5 ms hold-off.
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
