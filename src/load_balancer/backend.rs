//! Backend abstraction.
//!
//! # Responsibilities
//! - Identify a backend by its endpoint (address, port)
//! - Track active connections (for Least Connections and connection limits)
//! - Track health state (Up/Down) with debounce counters

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::ops::Deref;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::health::state::{Thresholds, Transition};

/// Network identity of a backend server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    address: IpAddr,
    port: u16,
}

impl Endpoint {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Resolve `host:port`, taking the first address the resolver returns.
    ///
    /// This may block on DNS and must only be called outside the reactor.
    pub fn resolve(spec: &str) -> io::Result<Self> {
        if let Ok(endpoint) = spec.parse() {
            return Ok(endpoint);
        }
        spec.to_socket_addrs()?
            .next()
            .map(Self::from)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses found for {spec}"),
                )
            })
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl FromStr for Endpoint {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>().map(Self::from)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}

/// Health State enum.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Up = 0,
    Down = 1,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Down,
            _ => HealthState::Up,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Up => f.write_str("up"),
            HealthState::Down => f.write_str("down"),
        }
    }
}

/// A single backend server.
#[derive(Debug)]
pub struct Backend {
    endpoint: Endpoint,
    name: Option<String>,
    /// Maximum concurrent connections allowed, unlimited when `None`.
    max_connections: Option<usize>,
    active_connections: AtomicUsize,

    /// Current health state (0=Up, 1=Down).
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
}

impl Backend {
    /// Create a new backend. Backends start Up until the first probe says otherwise.
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_limits(endpoint, None, None)
    }

    pub fn with_limits(
        endpoint: Endpoint,
        name: Option<String>,
        max_connections: Option<usize>,
    ) -> Self {
        Self {
            endpoint,
            name,
            max_connections,
            active_connections: AtomicUsize::new(0),
            state: AtomicU8::new(HealthState::Up as u8),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
        }
    }

    /// Same identity and limits, fresh health and connection state.
    pub fn fresh(&self) -> Self {
        Self::with_limits(self.endpoint, self.name.clone(), self.max_connections)
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Configured name, falling back to the endpoint.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.endpoint.to_string(),
        }
    }

    /// Get the current number of active connections.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn has_capacity(&self) -> bool {
        match self.max_connections {
            Some(max) => self.active_connections() < max,
            None => true,
        }
    }

    /// Try to create a connection guard that increments the active count.
    ///
    /// Returns `None` when the backend is at its connection limit.
    pub fn try_create_guard(self: &Arc<Self>) -> Option<BackendConnectionGuard> {
        let mut prev = self.active_connections.load(Ordering::Relaxed);
        loop {
            if self.max_connections.is_some_and(|max| prev >= max) {
                return None;
            }
            match self.active_connections.compare_exchange_weak(
                prev,
                prev + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }
        Some(BackendConnectionGuard {
            backend: self.clone(),
        })
    }

    fn release(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    // --- Health Logic ---

    pub fn state(&self) -> HealthState {
        HealthState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_up(&self) -> bool {
        self.state() == HealthState::Up
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes.load(Ordering::Relaxed)
    }

    /// Feed one probe outcome through the debounce counters.
    ///
    /// Returns the transition when this outcome committed one. Counters restart
    /// from zero after every transition.
    pub fn record_probe(&self, success: bool, thresholds: Thresholds) -> Option<Transition> {
        if success {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            if self.is_up() {
                return None;
            }
            let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
            if successes >= thresholds.healthy() {
                self.consecutive_successes.store(0, Ordering::Relaxed);
                self.state.store(HealthState::Up as u8, Ordering::Release);
                return Some(Transition::WentUp);
            }
        } else {
            self.consecutive_successes.store(0, Ordering::Relaxed);
            if !self.is_up() {
                return None;
            }
            let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= thresholds.unhealthy() {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.state.store(HealthState::Down as u8, Ordering::Release);
                return Some(Transition::WentDown);
            }
        }
        None
    }

    /// Forget probe history and return to Up.
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
        self.state.store(HealthState::Up as u8, Ordering::Release);
    }
}

/// A RAII guard that manages the active connection count.
#[derive(Debug)]
pub struct BackendConnectionGuard {
    backend: Arc<Backend>,
}

impl Deref for BackendConnectionGuard {
    type Target = Backend;
    fn deref(&self) -> &Self::Target {
        &self.backend
    }
}

impl Drop for BackendConnectionGuard {
    fn drop(&mut self) {
        self.backend.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> Backend {
        Backend::new("127.0.0.1:9001".parse().unwrap())
    }

    #[test]
    fn endpoint_identity_is_address_and_port() {
        let a: Endpoint = "127.0.0.1:9001".parse().unwrap();
        let b = Endpoint::new("127.0.0.1".parse().unwrap(), 9001);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "127.0.0.1:9001");
        assert_ne!(a, "127.0.0.1:9002".parse().unwrap());
    }

    #[test]
    fn endpoint_resolves_localhost() {
        let endpoint = Endpoint::resolve("localhost:80").unwrap();
        assert!(endpoint.address().is_loopback());
        assert_eq!(endpoint.port(), 80);
    }

    #[test]
    fn three_failures_take_backend_down() {
        let b = backend();
        let t = Thresholds::default();
        assert_eq!(b.record_probe(false, t), None);
        assert_eq!(b.record_probe(false, t), None);
        assert!(b.is_up());
        assert_eq!(b.record_probe(false, t), Some(Transition::WentDown));
        assert_eq!(b.state(), HealthState::Down);
    }

    #[test]
    fn success_interrupts_failure_streak() {
        let b = backend();
        let t = Thresholds::default();
        b.record_probe(false, t);
        b.record_probe(false, t);
        b.record_probe(true, t);
        b.record_probe(false, t);
        b.record_probe(false, t);
        assert!(b.is_up());
        assert_eq!(b.consecutive_failures(), 2);
    }

    #[test]
    fn one_success_brings_backend_up() {
        let b = backend();
        let t = Thresholds::default();
        for _ in 0..3 {
            b.record_probe(false, t);
        }
        assert_eq!(b.record_probe(true, t), Some(Transition::WentUp));
        assert!(b.is_up());
    }

    #[test]
    fn reset_clears_history() {
        let b = backend();
        let t = Thresholds::default();
        for _ in 0..5 {
            b.record_probe(false, t);
        }
        b.reset();
        assert!(b.is_up());
        assert_eq!(b.consecutive_failures(), 0);
        assert_eq!(b.consecutive_successes(), 0);
    }

    #[test]
    fn guard_respects_max_connections() {
        let b = Arc::new(Backend::with_limits(
            "127.0.0.1:9001".parse().unwrap(),
            None,
            Some(1),
        ));
        let guard = b.try_create_guard().unwrap();
        assert_eq!(b.active_connections(), 1);
        assert!(b.try_create_guard().is_none());
        drop(guard);
        assert_eq!(b.active_connections(), 0);
        assert!(b.try_create_guard().is_some());
    }
}
