//! Listening socket and accept-time admission.
//!
//! # Responsibilities
//! - Bind with port reuse so several reactors can share one port
//! - Accept clients without blocking
//! - Reserve a backend for each client before any bytes move
//!
//! # Design Decisions
//! - Port reuse is a checked two-step: `SO_REUSEPORT` first, `SO_REUSEADDR`
//!   when the platform refuses it; the outcome is reported to the caller
//! - A client that cannot be given a backend is closed at once, never queued

use std::io;
use std::net::SocketAddr;

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::ProxyError;
use crate::load_balancer::BackendPool;
use crate::net::connection::{ConnectionPair, PairSettings};
use crate::protocol::ProtocolFactory;

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// Failed to create or configure the socket.
    Socket(io::Error),
    /// Failed to bind to address.
    Bind { addr: SocketAddr, source: io::Error },
    /// Failed to add the listener to the readiness set.
    Register(io::Error),
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Socket(e) => write!(f, "Failed to create listening socket: {}", e),
            ListenerError::Bind { addr, source } => write!(f, "Failed to bind {}: {}", addr, source),
            ListenerError::Register(e) => write!(f, "Failed to register listener: {}", e),
        }
    }
}

impl std::error::Error for ListenerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ListenerError::Socket(e) | ListenerError::Register(e) => Some(e),
            ListenerError::Bind { source, .. } => Some(source),
        }
    }
}

/// Which reuse option the listening socket ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseMode {
    /// `SO_REUSEPORT`: several listeners may share the port.
    Port,
    /// `SO_REUSEADDR` only: a single listener per port.
    Address,
}

impl ReuseMode {
    pub fn allows_sharing(&self) -> bool {
        matches!(self, ReuseMode::Port)
    }
}

/// A bound, non-blocking listening socket.
#[derive(Debug)]
pub struct ListenerTransport {
    inner: TcpListener,
    local_addr: SocketAddr,
    reuse: ReuseMode,
    nodelay: bool,
    registered: bool,
}

impl ListenerTransport {
    /// Bind `addr` with the given backlog.
    pub fn bind(addr: SocketAddr, backlog: u32, nodelay: bool) -> Result<Self, ListenerError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(ListenerError::Socket)?;
        let reuse = enable_reuse(&socket).map_err(ListenerError::Socket)?;
        socket.set_nonblocking(true).map_err(ListenerError::Socket)?;
        socket
            .bind(&addr.into())
            .map_err(|source| ListenerError::Bind { addr, source })?;
        let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
        socket
            .listen(backlog)
            .map_err(|source| ListenerError::Bind { addr, source })?;

        let inner = TcpListener::from_std(socket.into());
        let local_addr = inner.local_addr().map_err(ListenerError::Socket)?;

        tracing::info!(
            address = %local_addr,
            backlog,
            reuse = ?reuse,
            "Listener bound"
        );

        Ok(Self {
            inner,
            local_addr,
            reuse,
            nodelay,
            registered: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn reuse_mode(&self) -> ReuseMode {
        self.reuse
    }

    /// Register for readability; accepts are driven by the reactor from here on.
    pub fn start_processing(&mut self, registry: &Registry, token: Token) -> Result<(), ListenerError> {
        registry
            .register(&mut self.inner, token, Interest::READABLE)
            .map_err(ListenerError::Register)?;
        self.registered = true;
        tracing::debug!(address = %self.local_addr, "Listener processing");
        Ok(())
    }

    /// Accept one pending client.
    ///
    /// `WouldBlock` means the accept queue is empty.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.inner.accept()?;
        if let Err(e) = stream.set_nodelay(self.nodelay) {
            tracing::debug!(peer_addr = %peer, error = %e, "Failed to set TCP_NODELAY on client");
        }
        Ok((stream, peer))
    }

    /// Unregister and close the listening socket.
    pub fn shutdown(mut self, registry: &Registry) {
        if self.registered {
            if let Err(e) = registry.deregister(&mut self.inner) {
                tracing::warn!(address = %self.local_addr, error = %e, "Failed to deregister listener");
            }
        }
        tracing::info!(address = %self.local_addr, "Listener closed");
    }
}

/// Try `SO_REUSEPORT`, falling back to `SO_REUSEADDR` when unsupported.
fn enable_reuse(socket: &Socket) -> io::Result<ReuseMode> {
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    match socket.set_reuse_port(true) {
        Ok(()) => return Ok(ReuseMode::Port),
        Err(e) => {
            tracing::warn!(error = %e, "SO_REUSEPORT unavailable, falling back to SO_REUSEADDR");
        }
    }
    socket.set_reuse_address(true)?;
    Ok(ReuseMode::Address)
}

/// Turn an accepted client into a pair with a backend connect in flight.
///
/// On error the client has already been dropped, which closes it.
pub fn admit(
    client: TcpStream,
    peer_addr: SocketAddr,
    pool: &BackendPool,
    protocol: &ProtocolFactory,
    settings: &PairSettings,
) -> Result<ConnectionPair, ProxyError> {
    let guard = pool.next_healthy()?;
    let mut pair = ConnectionPair::accepted(client, peer_addr, protocol(), settings);
    pair.connect(guard, settings.connect_timeout)?;
    Ok(pair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::net::connection::ConnectionState;
    use std::time::Duration;

    fn settings() -> PairSettings {
        PairSettings {
            chunk_size: 4096,
            max_buffer: 65536,
            connect_timeout: Duration::from_secs(1),
            nodelay: true,
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn second_listener_shares_port_when_reuse_port_is_available() {
        let first = ListenerTransport::bind(loopback(), 16, true).unwrap();
        assert_ne!(first.local_addr().port(), 0);
        if first.reuse_mode().allows_sharing() {
            let second = ListenerTransport::bind(first.local_addr(), 16, true).unwrap();
            assert_eq!(second.local_addr(), first.local_addr());
        }
    }

    #[test]
    fn admit_without_backends_rejects() {
        let listener = ListenerTransport::bind(loopback(), 16, true).unwrap();
        let _client = std::net::TcpStream::connect(listener.local_addr()).unwrap();
        let (stream, peer) = loop {
            match listener.accept() {
                Ok(accepted) => break accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5))
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        };

        let factory = crate::protocol::factory(&ProxyConfig::default());
        let result = admit(stream, peer, &BackendPool::new(), &factory, &settings());
        assert!(matches!(result, Err(ProxyError::NoHealthyBackend)));
    }

    #[test]
    fn admit_starts_connecting_and_holds_a_slot() {
        let backend = std::net::TcpListener::bind(loopback()).unwrap();
        let pool = BackendPool::new();
        pool.add(backend.local_addr().unwrap().into());

        let listener = ListenerTransport::bind(loopback(), 16, true).unwrap();
        let _client = std::net::TcpStream::connect(listener.local_addr()).unwrap();
        let (stream, peer) = loop {
            match listener.accept() {
                Ok(accepted) => break accepted,
                Err(_) => std::thread::sleep(Duration::from_millis(5)),
            }
        };

        let factory = crate::protocol::factory(&ProxyConfig::default());
        let pair = admit(stream, peer, &pool, &factory, &settings()).unwrap();
        assert_eq!(pair.state(), ConnectionState::Connecting);
        assert!(pair.connect_deadline().is_some());
        assert_eq!(pool.list_all().iter().next().unwrap().active_connections, 1);
        drop(pair);
        assert_eq!(pool.list_all().iter().next().unwrap().active_connections, 0);
    }
}
