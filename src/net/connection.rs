//! Connection pair state machine.
//!
//! # Responsibilities
//! - Own the client socket, the backend link and both relay directions
//! - Drive `Accepted → Connecting → Proxying → HalfClosed → Closing → Closed`
//! - Compute the readiness interest each socket needs right now
//!
//! # Design Decisions
//! - The backend handle is a state-tagged union: it cannot be used for
//!   relaying until the connect has been confirmed
//! - Teardown always closes the backend first, then the client
//! - Every pair holds a backend connection guard, so active counts follow
//!   pair lifetime exactly

use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::error::ProxyError;
use crate::load_balancer::{BackendConnectionGuard, Endpoint};
use crate::net::relay::Channel;
use crate::observability::metrics;
use crate::protocol::ProxyProtocol;

/// Global atomic counter for connection IDs.
/// Relaxed ordering is sufficient since only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Which socket of a pair an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Backend,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Backend => f.write_str("backend"),
        }
    }
}

/// Direction of byte flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToBackend => "client_to_backend",
            Direction::BackendToClient => "backend_to_client",
        }
    }
}

/// Connection state, driven only by the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Client accepted, no connect attempt issued yet.
    Accepted,
    /// Non-blocking connect to the backend in flight.
    Connecting,
    /// Both sockets relaying.
    Proxying,
    /// The given direction has finished; the other keeps flowing.
    HalfClosed(Direction),
    /// Being torn down.
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Accepted => f.write_str("accepted"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Proxying => f.write_str("proxying"),
            ConnectionState::HalfClosed(dir) => write!(f, "half_closed({})", dir.as_str()),
            ConnectionState::Closing => f.write_str("closing"),
            ConnectionState::Closed => f.write_str("closed"),
        }
    }
}

/// Backend side of a pair.
#[derive(Debug)]
pub enum BackendLink {
    /// No connect attempt issued.
    Unassigned,
    Connecting {
        stream: TcpStream,
        deadline: Instant,
    },
    Established {
        stream: TcpStream,
    },
}

impl BackendLink {
    pub fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        match self {
            BackendLink::Unassigned => None,
            BackendLink::Connecting { stream, .. } | BackendLink::Established { stream } => {
                Some(stream)
            }
        }
    }
}

/// Readiness reported for one socket, detached from the poll's event buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl From<&mio::event::Event> for Readiness {
    fn from(event: &mio::event::Event) -> Self {
        Self {
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable() || event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

/// Per-pair tunables shared by every pair of a reactor.
#[derive(Debug, Clone, Copy)]
pub struct PairSettings {
    pub chunk_size: usize,
    pub max_buffer: usize,
    pub connect_timeout: Duration,
    pub nodelay: bool,
}

/// A client socket, its backend link and both relay directions.
pub struct ConnectionPair {
    id: ConnectionId,
    client: TcpStream,
    peer_addr: SocketAddr,
    backend: BackendLink,
    guard: Option<BackendConnectionGuard>,
    protocol: Box<dyn ProxyProtocol>,
    upstream: Channel,
    downstream: Channel,
    state: ConnectionState,
    nodelay: bool,
    created_at: Instant,
    last_activity: Instant,
    client_token: Token,
    backend_token: Token,
    client_interest: Option<Interest>,
    backend_interest: Option<Interest>,
}

impl fmt::Debug for ConnectionPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPair")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("backend", &self.backend_endpoint())
            .field("state", &self.state)
            .finish()
    }
}

impl ConnectionPair {
    /// Wrap a freshly accepted client. The pair starts in `Accepted`.
    pub fn accepted(
        client: TcpStream,
        peer_addr: SocketAddr,
        protocol: Box<dyn ProxyProtocol>,
        settings: &PairSettings,
    ) -> Self {
        let max_pending = protocol.max_pending();
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            client,
            peer_addr,
            backend: BackendLink::Unassigned,
            guard: None,
            protocol,
            upstream: Channel::new(settings.max_buffer, max_pending),
            downstream: Channel::new(settings.max_buffer, max_pending),
            state: ConnectionState::Accepted,
            nodelay: settings.nodelay,
            created_at: now,
            last_activity: now,
            client_token: Token(usize::MAX),
            backend_token: Token(usize::MAX),
            client_interest: None,
            backend_interest: None,
        }
    }

    /// Issue the non-blocking connect to the reserved backend.
    pub fn connect(
        &mut self,
        guard: BackendConnectionGuard,
        timeout: Duration,
    ) -> Result<(), ProxyError> {
        let endpoint = guard.endpoint();
        let stream = TcpStream::connect(endpoint.socket_addr())
            .map_err(|source| ProxyError::BackendConnectFailed { endpoint, source })?;
        self.backend = BackendLink::Connecting {
            stream,
            deadline: Instant::now() + timeout,
        };
        self.guard = Some(guard);
        self.state = ConnectionState::Connecting;
        tracing::debug!(
            connection_id = %self.id,
            peer_addr = %self.peer_addr,
            backend = %endpoint,
            "Connecting to backend"
        );
        Ok(())
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn backend_endpoint(&self) -> Option<Endpoint> {
        self.guard.as_ref().map(|g| g.endpoint())
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn tokens(&self) -> (Token, Token) {
        (self.client_token, self.backend_token)
    }

    /// Deadline of an in-flight connect.
    pub fn connect_deadline(&self) -> Option<Instant> {
        match &self.backend {
            BackendLink::Connecting { deadline, .. } => Some(*deadline),
            _ => None,
        }
    }

    pub fn is_relaying(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Proxying | ConnectionState::HalfClosed(_)
        )
    }

    /// Register both sockets under the given tokens.
    pub fn register(
        &mut self,
        registry: &Registry,
        client_token: Token,
        backend_token: Token,
    ) -> io::Result<()> {
        self.client_token = client_token;
        self.backend_token = backend_token;
        let client = self.desired_client_interest();
        registry.register(&mut self.client, client_token, client)?;
        self.client_interest = Some(client);
        if let Some(backend) = self.desired_backend_interest() {
            if let Some(stream) = self.backend.stream_mut() {
                registry.register(stream, backend_token, backend)?;
                self.backend_interest = Some(backend);
            }
        }
        Ok(())
    }

    /// Re-register sockets whose interest changed since the last call.
    pub fn update_interest(&mut self, registry: &Registry) -> io::Result<()> {
        let client = self.desired_client_interest();
        if self.client_interest != Some(client) {
            registry.reregister(&mut self.client, self.client_token, client)?;
            self.client_interest = Some(client);
        }
        let backend = self.desired_backend_interest();
        if self.backend_interest != backend {
            if let (Some(interest), Some(stream)) = (backend, self.backend.stream_mut()) {
                registry.reregister(stream, self.backend_token, interest)?;
                self.backend_interest = Some(interest);
            }
        }
        Ok(())
    }

    /// Remove both sockets from the readiness set.
    ///
    /// Both deregistrations are attempted; the first error is returned.
    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        let client = registry.deregister(&mut self.client);
        let backend = match (self.backend_interest.take(), self.backend.stream_mut()) {
            (Some(_), Some(stream)) => registry.deregister(stream),
            _ => Ok(()),
        };
        self.client_interest = None;
        client.and(backend)
    }

    fn desired_client_interest(&self) -> Interest {
        if self.downstream.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    fn desired_backend_interest(&self) -> Option<Interest> {
        match &self.backend {
            BackendLink::Unassigned => None,
            BackendLink::Connecting { .. } => Some(Interest::WRITABLE),
            BackendLink::Established { .. } if self.upstream.wants_write() => {
                Some(Interest::READABLE | Interest::WRITABLE)
            }
            BackendLink::Established { .. } => Some(Interest::READABLE),
        }
    }

    /// React to readiness on one side.
    ///
    /// Any error returned means the pair must be closed.
    pub fn on_ready(&mut self, side: Side, readiness: Readiness) -> Result<(), ProxyError> {
        if readiness.error {
            let err = match side {
                Side::Client => self.client.take_error(),
                Side::Backend => match self.backend.stream_mut() {
                    Some(stream) => stream.take_error(),
                    None => Ok(None),
                },
            };
            if let Some(err) = err.unwrap_or_else(Some) {
                if side == Side::Backend && self.state == ConnectionState::Connecting {
                    return Err(self.connect_failed(err));
                }
                return Err(ProxyError::PeerReset(err));
            }
        }

        if side == Side::Backend && self.state == ConnectionState::Connecting {
            if !self.finish_connect()? {
                return Ok(());
            }
        }

        self.pump()
    }

    /// Check whether the in-flight connect has completed.
    ///
    /// Returns `Ok(false)` while it is still pending.
    fn finish_connect(&mut self) -> Result<bool, ProxyError> {
        let BackendLink::Connecting { stream, .. } = &mut self.backend else {
            return Ok(true);
        };
        match stream.take_error() {
            Ok(None) => {}
            Ok(Some(err)) | Err(err) => return Err(self.connect_failed(err)),
        }
        match stream.peer_addr() {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(false),
            Err(e) => return Err(self.connect_failed(e)),
        }

        if let Err(e) = stream.set_nodelay(self.nodelay) {
            tracing::debug!(connection_id = %self.id, error = %e, "Failed to set TCP_NODELAY on backend");
        }
        let link = std::mem::replace(&mut self.backend, BackendLink::Unassigned);
        if let BackendLink::Connecting { stream, .. } = link {
            self.backend = BackendLink::Established { stream };
        }
        self.state = ConnectionState::Proxying;
        self.last_activity = Instant::now();
        tracing::debug!(
            connection_id = %self.id,
            backend = ?self.backend_endpoint(),
            elapsed_ms = self.created_at.elapsed().as_millis() as u64,
            "Backend connection established"
        );
        Ok(true)
    }

    /// Failure to reach the backend, as recorded when the pair is closed.
    pub fn connect_failed(&self, source: io::Error) -> ProxyError {
        match self.backend_endpoint() {
            Some(endpoint) => ProxyError::BackendConnectFailed { endpoint, source },
            None => ProxyError::PeerReset(source),
        }
    }

    /// Move bytes in both directions until neither side makes progress.
    fn pump(&mut self) -> Result<(), ProxyError> {
        let chunk = self.protocol.chunk_size();
        loop {
            let mut progress = 0;

            if self.upstream.wants_read() {
                let protocol = &mut self.protocol;
                progress += self
                    .upstream
                    .fill(&mut self.client, chunk, |input, out| {
                        protocol.on_client_readable(input, out)
                    })?;
            }

            if let BackendLink::Established { stream } = &mut self.backend {
                let written = self.upstream.flush(stream)?;
                if written > 0 {
                    metrics::record_bytes(Direction::ClientToBackend.as_str(), written);
                }
                progress += written;

                if self.downstream.wants_read() {
                    let protocol = &mut self.protocol;
                    progress += self.downstream.fill(stream, chunk, |input, out| {
                        protocol.on_server_readable(input, out)
                    })?;
                }

                let written = self.downstream.flush(&mut self.client)?;
                if written > 0 {
                    metrics::record_bytes(Direction::BackendToClient.as_str(), written);
                }
                progress += written;
            }

            if progress > 0 {
                self.last_activity = Instant::now();
            }
            let changed = self.propagate_shutdowns()?;
            if progress == 0 && !changed {
                break;
            }
        }
        self.update_state();
        Ok(())
    }

    /// Forward an orderly close once a direction has delivered everything.
    fn propagate_shutdowns(&mut self) -> Result<bool, ProxyError> {
        let mut changed = false;
        if let BackendLink::Established { stream } = &mut self.backend {
            if self.upstream.is_drained() && !self.upstream.sink_shut() {
                shutdown_write(stream)?;
                self.upstream.mark_sink_shut();
                changed = true;
            }
            if self.downstream.is_drained() && !self.downstream.sink_shut() {
                shutdown_write(&self.client)?;
                self.downstream.mark_sink_shut();
                changed = true;
            }
        }
        Ok(changed)
    }

    fn update_state(&mut self) {
        if !self.is_relaying() {
            return;
        }
        let up = self.upstream.sink_shut();
        let down = self.downstream.sink_shut();
        let next = match (up, down) {
            (true, true) => ConnectionState::Closing,
            (true, false) => ConnectionState::HalfClosed(Direction::ClientToBackend),
            (false, true) => ConnectionState::HalfClosed(Direction::BackendToClient),
            (false, false) => ConnectionState::Proxying,
        };
        if next != self.state {
            tracing::debug!(connection_id = %self.id, from = %self.state, to = %next, "Connection state change");
            self.state = next;
        }
    }

    /// Enter `Closing` from any state.
    pub fn begin_close(&mut self) {
        self.state = ConnectionState::Closing;
    }

    /// Close the backend first, then the client. Consumes the pair; the
    /// summary carries the terminal `Closed` state.
    pub fn teardown(self) -> PairSummary {
        let mut summary = PairSummary {
            state: self.state,
            id: self.id,
            peer_addr: self.peer_addr,
            backend: self.backend_endpoint(),
            to_backend: self.upstream.relayed(),
            to_client: self.downstream.relayed(),
            lifetime: self.created_at.elapsed(),
        };
        let ConnectionPair {
            client,
            backend,
            guard,
            ..
        } = self;
        drop(backend);
        drop(guard);
        drop(client);
        summary.state = ConnectionState::Closed;
        summary
    }
}

fn shutdown_write(stream: &TcpStream) -> Result<(), ProxyError> {
    match stream.shutdown(Shutdown::Write) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        Err(e) => Err(ProxyError::from_io(e)),
    }
}

/// What a closed pair did, for the close log line.
#[derive(Debug, Clone, Copy)]
pub struct PairSummary {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub peer_addr: SocketAddr,
    pub backend: Option<Endpoint>,
    pub to_backend: u64,
    pub to_client: u64,
    pub lifetime: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("conn-"));
    }

    #[test]
    fn state_display_names_direction() {
        assert_eq!(
            ConnectionState::HalfClosed(Direction::ClientToBackend).to_string(),
            "half_closed(client_to_backend)"
        );
        assert_eq!(ConnectionState::Closing.to_string(), "closing");
    }

    #[test]
    fn unassigned_link_has_no_stream() {
        let mut link = BackendLink::Unassigned;
        assert!(link.stream_mut().is_none());
    }
}
