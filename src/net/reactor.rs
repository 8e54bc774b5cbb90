//! Connection-multiplexing event loop.
//!
//! # Responsibilities
//! - Own one readiness set, one listener and the descriptor registry
//! - Route every readiness event to its pair and side
//! - Enforce connect and idle timeouts
//! - Apply lifecycle commands between iterations
//!
//! # Design Decisions
//! - Single-threaded: nothing inside the loop blocks except the readiness wait
//! - Events are serviced in the order the readiness call reports them
//! - An event for a token that is no longer registered is skipped; a pair
//!   closed earlier in the same batch is the only way that happens
//! - Commands arrive over a channel and a waker, so `shutdown` takes effect
//!   within one poll interval at worst

use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token, Waker};
use thiserror::Error;

use crate::config::BalancerConfig;
use crate::error::ProxyError;
use crate::load_balancer::BackendPool;
use crate::net::connection::{ConnectionId, ConnectionState, PairSettings, Readiness};
use crate::net::listener::{self, ListenerError, ListenerTransport};
use crate::net::registry::ConnectionRegistry;
use crate::observability::metrics;
use crate::protocol::ProtocolFactory;

pub const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("failed to create readiness set: {0}")]
    Setup(#[source] io::Error),

    #[error("readiness wait failed: {0}")]
    Poll(#[source] io::Error),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("connection registry corrupted: {0}")]
    RegistryCorrupted(String),
}

/// How in-flight pairs are treated when a reactor stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop accepting and let pairs finish, bounded by the drain timeout.
    Drain,
    /// Close every pair immediately.
    Terminate,
}

#[derive(Debug)]
pub enum Command {
    /// Resume accepting on a freshly bound listener.
    Enable {
        listener: ListenerTransport,
        done: mpsc::Sender<Result<(), ListenerError>>,
    },
    /// Close the listener; existing pairs are untouched.
    Disable { done: mpsc::Sender<()> },
    Shutdown(ShutdownMode),
}

/// Counters shared between reactors and whoever observes them.
#[derive(Debug, Default)]
pub struct ReactorStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    connect_failed: AtomicU64,
    closed: AtomicU64,
    /// Pair descriptors currently in any registry; two per pair.
    registered: AtomicUsize,
}

/// Point-in-time copy of [`ReactorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub connect_failed: u64,
    pub closed: u64,
    pub active_pairs: usize,
    pub registered_descriptors: usize,
}

impl ReactorStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let registered = self.registered.load(Ordering::Relaxed);
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            connect_failed: self.connect_failed.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            active_pairs: registered / 2,
            registered_descriptors: registered,
        }
    }

    pub(crate) fn record_registered(&self, n: usize) {
        let now = self.registered.fetch_add(n, Ordering::Relaxed) + n;
        metrics::set_active_connections(now / 2);
    }

    pub(crate) fn record_deregistered(&self, n: usize) {
        let now = self.registered.fetch_sub(n, Ordering::Relaxed).saturating_sub(n);
        metrics::set_active_connections(now / 2);
    }

    fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn record_connect_failed(&self) {
        self.connect_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Loop tunables derived from configuration.
#[derive(Debug, Clone, Copy)]
pub struct ReactorSettings {
    pub pair: PairSettings,
    pub idle_timeout: Option<Duration>,
    pub poll_interval: Duration,
    pub drain_timeout: Duration,
}

impl ReactorSettings {
    pub fn from_config(config: &BalancerConfig) -> Self {
        Self {
            pair: PairSettings {
                chunk_size: config.proxy.chunk_size,
                max_buffer: config.proxy.max_buffer,
                connect_timeout: config.timeouts.connect(),
                nodelay: config.listener.nodelay,
            },
            idle_timeout: config.timeouts.idle(),
            poll_interval: config.timeouts.poll_interval(),
            drain_timeout: config.timeouts.drain(),
        }
    }
}

/// Control side of a running reactor. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct ReactorHandle {
    name: Arc<str>,
    commands: mpsc::Sender<Command>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a command and wake the loop. False once the reactor has exited.
    pub fn send(&self, command: Command) -> bool {
        if self.commands.send(command).is_err() {
            return false;
        }
        if let Err(e) = self.waker.wake() {
            tracing::warn!(reactor = %self.name, error = %e, "Failed to wake reactor");
        }
        true
    }

    pub fn shutdown(&self, mode: ShutdownMode) -> bool {
        self.send(Command::Shutdown(mode))
    }

    /// Close the listener and wait until the reactor confirms it.
    pub fn disable(&self, timeout: Duration) -> bool {
        let (done, ack) = mpsc::channel();
        self.send(Command::Disable { done }) && ack.recv_timeout(timeout).is_ok()
    }

    /// Hand over a bound listener and wait until it is being processed.
    ///
    /// `None` when the reactor did not answer within `timeout`.
    pub fn enable(
        &self,
        listener: ListenerTransport,
        timeout: Duration,
    ) -> Option<Result<(), ListenerError>> {
        let (done, ack) = mpsc::channel();
        if !self.send(Command::Enable { listener, done }) {
            return None;
        }
        ack.recv_timeout(timeout).ok()
    }
}

pub struct Reactor {
    name: Arc<str>,
    poll: Poll,
    events: Events,
    ready: Vec<(Token, Readiness)>,
    listener: Option<ListenerTransport>,
    registry: ConnectionRegistry,
    pool: BackendPool,
    protocol: ProtocolFactory,
    settings: ReactorSettings,
    commands: mpsc::Receiver<Command>,
    stats: Arc<ReactorStats>,
    _waker: Arc<Waker>,
    /// Set when an accept failed with clients possibly still queued.
    accept_retry: bool,
    draining: bool,
    /// `None` while draining means the drain timeout is unbounded.
    drain_deadline: Option<Instant>,
    stopped: bool,
}

impl Reactor {
    /// Create the readiness set and start processing `listener` on it.
    pub fn new(
        name: impl Into<Arc<str>>,
        mut listener: ListenerTransport,
        pool: BackendPool,
        protocol: ProtocolFactory,
        settings: ReactorSettings,
        stats: Arc<ReactorStats>,
    ) -> Result<(Self, ReactorHandle), ReactorError> {
        let name = name.into();
        let poll = Poll::new().map_err(ReactorError::Setup)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).map_err(ReactorError::Setup)?);
        listener.start_processing(poll.registry(), LISTENER)?;

        let (tx, rx) = mpsc::channel();
        let handle = ReactorHandle {
            name: name.clone(),
            commands: tx,
            waker: waker.clone(),
        };

        let reactor = Self {
            name,
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            ready: Vec::with_capacity(EVENT_CAPACITY),
            listener: Some(listener),
            registry: ConnectionRegistry::new(stats.clone()),
            pool,
            protocol,
            settings,
            commands: rx,
            stats,
            _waker: waker,
            accept_retry: false,
            draining: false,
            drain_deadline: None,
            stopped: false,
        };
        Ok((reactor, handle))
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.as_ref().map(ListenerTransport::local_addr)
    }

    /// Pairs currently owned by this reactor.
    pub fn connections(&self) -> usize {
        self.registry.len()
    }

    /// Run until shut down.
    pub fn run(mut self) -> Result<(), ReactorError> {
        tracing::info!(reactor = %self.name, address = ?self.local_addr(), "Reactor running");
        while self.turn()? {}
        if let Some(listener) = self.listener.take() {
            listener.shutdown(self.poll.registry());
        }
        tracing::info!(reactor = %self.name, "Reactor stopped");
        Ok(())
    }

    /// One loop iteration. Returns false once the reactor should stop.
    pub fn turn(&mut self) -> Result<bool, ReactorError> {
        if let Err(e) = self
            .poll
            .poll(&mut self.events, Some(self.settings.poll_interval))
        {
            if e.kind() != io::ErrorKind::Interrupted {
                return Err(ReactorError::Poll(e));
            }
        }

        // Edge-triggered: a failed accept leaves no readiness behind it.
        let retry_accept = std::mem::take(&mut self.accept_retry);

        let mut ready = std::mem::take(&mut self.ready);
        ready.extend(self.events.iter().map(|e| (e.token(), Readiness::from(e))));
        for &(token, readiness) in &ready {
            match token {
                LISTENER => self.accept_ready()?,
                WAKER => {}
                token => self.dispatch(token, readiness)?,
            }
        }
        ready.clear();
        self.ready = ready;

        if retry_accept {
            self.accept_ready()?;
        }

        self.process_commands()?;
        self.sweep_timeouts()?;
        self.check_stop()
    }

    fn accept_ready(&mut self) -> Result<(), ReactorError> {
        loop {
            let Some(listener) = &self.listener else {
                return Ok(());
            };
            match listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer)?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    tracing::warn!(reactor = %self.name, error = %e, "Accept failed, retrying next turn");
                    self.accept_retry = true;
                    return Ok(());
                }
            }
        }
    }

    fn admit(&mut self, stream: mio::net::TcpStream, peer: std::net::SocketAddr) -> Result<(), ReactorError> {
        metrics::record_accepted();
        let pair = match listener::admit(stream, peer, &self.pool, &self.protocol, &self.settings.pair) {
            Ok(pair) => pair,
            Err(err) => {
                self.reject(peer, err);
                return Ok(());
            }
        };

        let backend = pair.backend_endpoint();
        match self.registry.insert(pair, self.poll.registry()) {
            Ok(id) => {
                self.stats.record_accepted();
                tracing::debug!(
                    connection_id = %id,
                    peer_addr = %peer,
                    backend = ?backend,
                    "Connection accepted"
                );
            }
            Err(e) => self.reject(peer, ProxyError::PeerReset(e)),
        }
        Ok(())
    }

    fn reject(&self, peer: std::net::SocketAddr, err: ProxyError) {
        self.stats.record_rejected();
        metrics::record_rejected(err.reason());
        match &err {
            ProxyError::NoHealthyBackend => {
                tracing::warn!(peer_addr = %peer, "No healthy backend, closing client");
            }
            ProxyError::BackendConnectFailed { endpoint, .. } => {
                self.stats.record_connect_failed();
                tracing::warn!(peer_addr = %peer, backend = %endpoint, error = %err, "Backend connect failed, closing client");
            }
            _ => {
                tracing::warn!(peer_addr = %peer, error = %err, "Connection rejected");
            }
        }
    }

    fn dispatch(&mut self, token: Token, readiness: Readiness) -> Result<(), ReactorError> {
        let Some((id, side)) = self.registry.lookup(token) else {
            tracing::trace!(token = token.0, "Event for closed connection skipped");
            return Ok(());
        };
        let Some(pair) = self.registry.get_mut(id) else {
            return Err(ReactorError::RegistryCorrupted(format!(
                "token {} maps to missing {id}",
                token.0
            )));
        };

        match pair.on_ready(side, readiness) {
            Ok(()) if pair.state() == ConnectionState::Closing => self.close(id, None),
            Ok(()) => match pair.update_interest(self.poll.registry()) {
                Ok(()) => Ok(()),
                Err(e) => self.close(id, Some(ProxyError::PeerReset(e))),
            },
            Err(err) => self.close(id, Some(err)),
        }
    }

    /// Tear a pair down and record why.
    fn close(&mut self, id: ConnectionId, cause: Option<ProxyError>) -> Result<(), ReactorError> {
        let Some(mut pair) = self.registry.remove(id, self.poll.registry())? else {
            return Ok(());
        };
        let state = pair.state();
        pair.begin_close();
        let summary = pair.teardown();
        self.stats.record_closed();
        metrics::record_closed();

        match cause {
            None => tracing::debug!(
                connection_id = %summary.id,
                peer_addr = %summary.peer_addr,
                backend = ?summary.backend,
                to_backend = summary.to_backend,
                to_client = summary.to_client,
                lifetime_ms = summary.lifetime.as_millis() as u64,
                "Connection closed"
            ),
            Some(err @ ProxyError::BackendConnectFailed { .. }) => {
                self.stats.record_connect_failed();
                metrics::record_rejected(err.reason());
                tracing::warn!(
                    connection_id = %summary.id,
                    peer_addr = %summary.peer_addr,
                    error = %err,
                    "Backend connect failed, client closed"
                );
            }
            Some(err) => tracing::debug!(
                connection_id = %summary.id,
                peer_addr = %summary.peer_addr,
                backend = ?summary.backend,
                state = %state,
                reason = err.reason(),
                error = %err,
                "Connection closed on error"
            ),
        }
        Ok(())
    }

    fn close_all(&mut self) -> Result<(), ReactorError> {
        for id in self.registry.ids() {
            self.close(id, None)?;
        }
        Ok(())
    }

    fn sweep_timeouts(&mut self) -> Result<(), ReactorError> {
        let now = Instant::now();
        let idle_timeout = self.settings.idle_timeout;
        let mut expired = Vec::new();

        for pair in self.registry.pairs() {
            if let Some(deadline) = pair.connect_deadline() {
                if now >= deadline {
                    let err = pair.connect_failed(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "connect timed out",
                    ));
                    expired.push((pair.id(), Some(err)));
                }
            } else if let Some(idle) = idle_timeout {
                if pair.is_relaying() && pair.idle_for(now) >= idle {
                    tracing::debug!(
                        connection_id = %pair.id(),
                        idle_secs = idle.as_secs(),
                        "Idle timeout"
                    );
                    expired.push((pair.id(), None));
                }
            }
        }

        for (id, cause) in expired {
            self.close(id, cause)?;
        }
        Ok(())
    }

    fn process_commands(&mut self) -> Result<(), ReactorError> {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.apply(command)?,
                Err(mpsc::TryRecvError::Empty) => return Ok(()),
                Err(mpsc::TryRecvError::Disconnected) => {
                    if !self.draining && !self.stopped {
                        tracing::info!(reactor = %self.name, "Control handle dropped, draining");
                        self.begin_drain();
                    }
                    return Ok(());
                }
            }
        }
    }

    fn apply(&mut self, command: Command) -> Result<(), ReactorError> {
        match command {
            Command::Enable { mut listener, done } => {
                let outcome = if self.listener.is_some() || self.draining || self.stopped {
                    tracing::debug!(reactor = %self.name, "Enable ignored");
                    Ok(())
                } else {
                    match listener.start_processing(self.poll.registry(), LISTENER) {
                        Ok(()) => {
                            tracing::info!(reactor = %self.name, address = %listener.local_addr(), "Accepting resumed");
                            self.listener = Some(listener);
                            Ok(())
                        }
                        Err(e) => {
                            tracing::error!(reactor = %self.name, error = %e, "Failed to resume accepting");
                            Err(e)
                        }
                    }
                };
                let _ = done.send(outcome);
            }
            Command::Disable { done } => {
                self.close_listener();
                tracing::info!(reactor = %self.name, connections = self.registry.len(), "Accepting paused");
                let _ = done.send(());
            }
            Command::Shutdown(ShutdownMode::Drain) => self.begin_drain(),
            Command::Shutdown(ShutdownMode::Terminate) => {
                tracing::info!(reactor = %self.name, connections = self.registry.len(), "Terminating");
                self.close_listener();
                self.close_all()?;
                self.stopped = true;
            }
        }
        Ok(())
    }

    fn close_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.shutdown(self.poll.registry());
        }
    }

    fn begin_drain(&mut self) {
        self.close_listener();
        if !self.draining {
            self.draining = true;
            self.drain_deadline = Instant::now().checked_add(self.settings.drain_timeout);
            tracing::info!(
                reactor = %self.name,
                connections = self.registry.len(),
                drain_secs = self.settings.drain_timeout.as_secs(),
                "Draining"
            );
        }
    }

    fn check_stop(&mut self) -> Result<bool, ReactorError> {
        if self.stopped {
            return Ok(false);
        }
        if !self.draining {
            return Ok(true);
        }
        if self.registry.is_empty() {
            tracing::info!(reactor = %self.name, "Drain complete");
            return Ok(false);
        }
        if self.drain_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            tracing::warn!(
                reactor = %self.name,
                remaining = self.registry.len(),
                "Drain timeout reached, closing remaining connections"
            );
            self.close_all()?;
            return Ok(false);
        }
        Ok(true)
    }
}
