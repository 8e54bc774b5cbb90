//! Service composition root.
//!
//! # Responsibilities
//! - Bind {protocol, address, port, pool, monitor} into one unit
//! - Start the reactor threads and the health monitor thread
//! - Expose `start` / `shutdown` / `terminate` / `enable` / `disable`
//!
//! # Design Decisions
//! - Binding happens on the caller's thread, so bind errors surface from
//!   `start()` rather than from a background thread
//! - Reactor instances beyond the first are only started when the port can
//!   be shared (`SO_REUSEPORT`)
//! - The health monitor runs on its own thread with a current-thread Tokio
//!   runtime; the pool's atomics are the only state it shares with reactors

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::config::{BackendConfig, BalancerConfig, StrategyKind};
use crate::health::{self, HealthMonitor, Probe, ProbeError};
use crate::lifecycle::Shutdown;
use crate::load_balancer::BackendPool;
use crate::net::{
    ListenerError, ListenerTransport, Reactor, ReactorError, ReactorHandle, ReactorSettings,
    ReactorStats, ReuseMode, ShutdownMode, StatsSnapshot,
};
use crate::protocol::{self, ProtocolFactory};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid listen address `{0}`")]
    ListenAddress(String),

    #[error("failed to resolve backends: {0}")]
    Backend(#[source] io::Error),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Reactor(#[from] ReactorError),

    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("{0} did not acknowledge the command")]
    Unresponsive(String),

    #[error("{0} panicked")]
    Panicked(String),

    #[error("service is already running")]
    AlreadyRunning,

    #[error("service is not running")]
    NotRunning,
}

/// Outcome of a backend reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: usize,
    pub removed: usize,
    pub total: usize,
}

pub struct Service {
    config: BalancerConfig,
    pool: BackendPool,
    monitor: Arc<HealthMonitor>,
    protocol: ProtocolFactory,
    stats: Arc<ReactorStats>,
    running: Option<Running>,
}

struct Running {
    local_addr: SocketAddr,
    reuse: ReuseMode,
    enabled: bool,
    handle: ServiceHandle,
    reactors: Vec<(String, JoinHandle<Result<(), ReactorError>>)>,
    monitor: Option<JoinHandle<()>>,
}

impl Service {
    /// Build the pool, probe and protocol described by `config`.
    ///
    /// Backend hostnames are resolved here.
    pub fn new(config: BalancerConfig) -> Result<Self, ServiceError> {
        let pool = BackendPool::from_config(&config.backends, config.proxy.strategy)
            .map_err(ServiceError::Backend)?;
        let probe = health::probe::from_config(&config.health_check)?;
        Ok(Self::with_parts(config, pool, probe))
    }

    /// Assemble a service from an existing pool and probe.
    pub fn with_parts(config: BalancerConfig, pool: BackendPool, probe: Arc<dyn Probe>) -> Self {
        let monitor = Arc::new(HealthMonitor::new(pool.clone(), probe, &config.health_check));
        let protocol = protocol::factory(&config.proxy);
        Self {
            config,
            pool,
            monitor,
            protocol,
            stats: Arc::new(ReactorStats::default()),
            running: None,
        }
    }

    /// Replace the framing policy. Takes effect for pairs accepted after `start`.
    pub fn with_protocol(mut self, protocol: ProtocolFactory) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    pub fn pool(&self) -> &BackendPool {
        &self.pool
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Address actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn reuse_mode(&self) -> Option<ReuseMode> {
        self.running.as_ref().map(|r| r.reuse)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.running.as_ref().is_some_and(|r| r.enabled)
    }

    /// Bind, start every reactor and the health monitor.
    pub fn start(&mut self) -> Result<SocketAddr, ServiceError> {
        if self.running.is_some() {
            return Err(ServiceError::AlreadyRunning);
        }

        let bind = self.config.listener.bind_address();
        let addr: SocketAddr = bind
            .parse()
            .map_err(|_| ServiceError::ListenAddress(bind.clone()))?;
        let listeners = self.bind_all(addr)?;
        let local_addr = listeners[0].local_addr();
        let reuse = listeners[0].reuse_mode();

        let shutdown = Arc::new(Shutdown::new());
        let settings = ReactorSettings::from_config(&self.config);

        let mut handles = Vec::with_capacity(listeners.len());
        let mut reactors = Vec::with_capacity(listeners.len());
        for (i, listener) in listeners.into_iter().enumerate() {
            let name = format!("reactor-{i}");
            let (reactor, handle) = Reactor::new(
                name.as_str(),
                listener,
                self.pool.clone(),
                self.protocol.clone(),
                settings,
                self.stats.clone(),
            )?;
            let thread = thread::Builder::new()
                .name(name.clone())
                .spawn(move || reactor.run())
                .map_err(|source| ServiceError::Spawn {
                    name: name.clone(),
                    source,
                })?;
            handles.push(handle);
            reactors.push((name, thread));
        }

        let handle = ServiceHandle {
            reactors: handles,
            shutdown: shutdown.clone(),
            pool: self.pool.clone(),
        };

        let monitor = if self.config.health_check.enabled {
            match self.spawn_monitor(&shutdown) {
                Ok(thread) => Some(thread),
                Err(e) => {
                    handle.signal(ShutdownMode::Terminate);
                    for (_, thread) in reactors {
                        let _ = thread.join();
                    }
                    return Err(e);
                }
            }
        } else {
            tracing::info!("Health checking disabled");
            None
        };

        tracing::info!(
            address = %local_addr,
            instances = reactors.len(),
            reuse = ?reuse,
            protocol = ?self.config.proxy.protocol,
            strategy = ?self.config.proxy.strategy,
            backends = self.pool.len(),
            "Service started"
        );

        self.running = Some(Running {
            local_addr,
            reuse,
            enabled: true,
            handle,
            reactors,
            monitor,
        });
        Ok(local_addr)
    }

    fn bind_all(&self, addr: SocketAddr) -> Result<Vec<ListenerTransport>, ServiceError> {
        let listener = &self.config.listener;
        let first = ListenerTransport::bind(addr, listener.backlog, listener.nodelay)?;
        let mut instances = listener.instances.max(1);
        if instances > 1 && !first.reuse_mode().allows_sharing() {
            tracing::warn!(
                requested = instances,
                "Port sharing unavailable, running a single reactor"
            );
            instances = 1;
        }

        // Later instances join the port the first one actually got.
        let shared = first.local_addr();
        let mut listeners = vec![first];
        for _ in 1..instances {
            listeners.push(ListenerTransport::bind(
                shared,
                listener.backlog,
                listener.nodelay,
            )?);
        }
        Ok(listeners)
    }

    fn spawn_monitor(&self, shutdown: &Shutdown) -> Result<JoinHandle<()>, ServiceError> {
        let name = "health-monitor".to_string();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|source| ServiceError::Spawn {
                name: name.clone(),
                source,
            })?;
        let monitor = self.monitor.clone();
        let rx = shutdown.subscribe();
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || runtime.block_on(monitor.run(rx)))
            .map_err(|source| ServiceError::Spawn { name, source })
    }

    /// Control handle usable from other threads or tasks.
    pub fn handle(&self) -> Result<ServiceHandle, ServiceError> {
        self.running
            .as_ref()
            .map(|r| r.handle.clone())
            .ok_or(ServiceError::NotRunning)
    }

    /// Stop accepting. Existing pairs keep relaying.
    pub fn disable(&mut self) -> Result<(), ServiceError> {
        let running = self.running.as_mut().ok_or(ServiceError::NotRunning)?;
        if !running.enabled {
            return Ok(());
        }
        for reactor in &running.handle.reactors {
            if !reactor.disable(COMMAND_TIMEOUT) {
                return Err(ServiceError::Unresponsive(reactor.name().to_string()));
            }
        }
        running.enabled = false;
        tracing::info!(address = %running.local_addr, "Service disabled");
        Ok(())
    }

    /// Resume accepting on the same address.
    pub fn enable(&mut self) -> Result<(), ServiceError> {
        let running = self.running.as_mut().ok_or(ServiceError::NotRunning)?;
        if running.enabled {
            return Ok(());
        }
        let config = &self.config.listener;
        for reactor in &running.handle.reactors {
            let listener = ListenerTransport::bind(running.local_addr, config.backlog, config.nodelay)?;
            match reactor.enable(listener, COMMAND_TIMEOUT) {
                Some(Ok(())) => {}
                Some(Err(e)) => return Err(ServiceError::Listener(e)),
                None => return Err(ServiceError::Unresponsive(reactor.name().to_string())),
            }
        }
        running.enabled = true;
        tracing::info!(address = %running.local_addr, "Service enabled");
        Ok(())
    }

    /// Stop accepting, let pairs finish within the drain timeout, then stop.
    pub fn shutdown(&mut self) -> Result<(), ServiceError> {
        self.stop(ShutdownMode::Drain)
    }

    /// Stop immediately, closing every pair.
    pub fn terminate(&mut self) -> Result<(), ServiceError> {
        self.stop(ShutdownMode::Terminate)
    }

    fn stop(&mut self, mode: ShutdownMode) -> Result<(), ServiceError> {
        let running = self.running.as_ref().ok_or(ServiceError::NotRunning)?;
        tracing::info!(mode = ?mode, "Service shutting down");
        running.handle.signal(mode);
        self.wait()
    }

    /// Block until every reactor has stopped, then stop the health monitor.
    ///
    /// Something else must have requested the stop, typically a
    /// [`ServiceHandle`] driven by signals.
    pub fn wait(&mut self) -> Result<(), ServiceError> {
        let running = self.running.take().ok_or(ServiceError::NotRunning)?;
        let mut result = Ok(());
        for (name, thread) in running.reactors {
            let outcome = match thread.join() {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    tracing::error!(reactor = %name, error = %e, "Reactor failed");
                    Err(ServiceError::Reactor(e))
                }
                Err(_) => Err(ServiceError::Panicked(name)),
            };
            if result.is_ok() {
                result = outcome;
            }
        }

        if !running.handle.shutdown.is_requested() {
            running.handle.shutdown.trigger(ShutdownMode::Drain);
        }
        if let Some(monitor) = running.monitor {
            if monitor.join().is_err() && result.is_ok() {
                result = Err(ServiceError::Panicked("health-monitor".to_string()));
            }
        }
        tracing::info!("Service stopped");
        result
    }

    /// Reconcile the pool with a new backend list.
    pub fn reload_backends(&self, backends: &[BackendConfig]) -> Result<ReloadSummary, ServiceError> {
        reload(&self.pool, backends)
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        if self.running.is_some() {
            let _ = self.terminate();
        }
    }
}

/// Cloneable control surface of a running service.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    reactors: Vec<ReactorHandle>,
    shutdown: Arc<Shutdown>,
    pool: BackendPool,
}

impl ServiceHandle {
    /// Escalating shutdown: the first call drains, later calls terminate.
    pub fn request_shutdown(&self) -> ShutdownMode {
        let mode = self.shutdown.request();
        self.forward(mode);
        mode
    }

    fn signal(&self, mode: ShutdownMode) {
        self.shutdown.trigger(mode);
        self.forward(mode);
    }

    fn forward(&self, mode: ShutdownMode) {
        for reactor in &self.reactors {
            if !reactor.shutdown(mode) {
                tracing::debug!(reactor = %reactor.name(), "Reactor already stopped");
            }
        }
    }

    pub fn reload_backends(&self, backends: &[BackendConfig]) -> Result<ReloadSummary, ServiceError> {
        reload(&self.pool, backends)
    }
}

fn reload(pool: &BackendPool, backends: &[BackendConfig]) -> Result<ReloadSummary, ServiceError> {
    let desired = BackendPool::from_config(backends, StrategyKind::RoundRobin)
        .map_err(ServiceError::Backend)?;
    let (added, removed) = pool.reconcile(&desired);
    let summary = ReloadSummary {
        added,
        removed,
        total: pool.len(),
    };
    tracing::info!(
        added = summary.added,
        removed = summary.removed,
        total = summary.total,
        "Backends reloaded"
    );
    Ok(summary)
}
