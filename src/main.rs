//! tcp-balancer
//!
//! A layer-4 TCP load balancer built on a readiness-driven event loop.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────┐
//!                        │                 TCP BALANCER                 │
//!                        │                                              │
//!     Client  ───────────┼─▶ listener ──▶ reactor ──▶ connection pair ──┼──▶ Backend
//!             ◀──────────┼── (accept)     (mio)       (relay buffers) ◀─┼───
//!                        │                   │                          │
//!                        │                   ▼                          │
//!                        │            backend pool ◀── health monitor   │
//!                        │            (round robin)    (tokio thread)   │
//!                        │                                              │
//!                        │   config (TOML, watcher)  lifecycle (signals)│
//!                        └──────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::Parser;
use tokio::sync::mpsc;

use tcp_balancer::config::{load_config, BalancerConfig, ConfigWatcher};
use tcp_balancer::lifecycle::{SignalEvent, Signals};
use tcp_balancer::observability::{logging, metrics};
use tcp_balancer::{Service, ServiceHandle};

#[derive(Parser)]
#[command(name = "tcp-balancer", version)]
#[command(about = "Layer-4 TCP load balancer", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "balancer.toml")]
    config: PathBuf,

    /// Reload the backend list whenever the configuration file changes.
    #[arg(short, long)]
    watch: bool,

    /// Override `observability.log_level`.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)?;
    if let Some(level) = &cli.log_level {
        config.observability.log_level = level.clone();
    }
    logging::init_logging(&config.observability);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "tcp-balancer starting");
    tracing::info!(
        path = ?cli.config,
        listen = %config.listener.bind_address(),
        backends = config.backends.len(),
        instances = config.listener.instances,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr)?;
    }

    let mut service = Service::new(config)?;
    service.start()?;
    let handle = service.handle()?;

    let mut signals = Signals::install()?;
    let (_watcher, mut updates) = if cli.watch {
        let (watcher, rx) = ConfigWatcher::new(&cli.config);
        (Some(watcher.run()?), Some(rx))
    } else {
        (None, None)
    };

    let mut waiter = tokio::task::spawn_blocking(move || service.wait());
    loop {
        tokio::select! {
            result = &mut waiter => {
                result??;
                break;
            }
            event = signals.recv() => match event {
                SignalEvent::Shutdown => {
                    let mode = handle.request_shutdown();
                    tracing::info!(mode = ?mode, "Shutdown requested");
                }
                SignalEvent::Reload => reload_from_disk(&handle, &cli.config),
            },
            Some(config) = next_update(&mut updates) => apply_backends(&handle, &config),
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn next_update(
    updates: &mut Option<mpsc::UnboundedReceiver<BalancerConfig>>,
) -> Option<BalancerConfig> {
    match updates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn reload_from_disk(handle: &ServiceHandle, path: &Path) {
    match load_config(path) {
        Ok(config) => apply_backends(handle, &config),
        Err(e) => {
            tracing::error!(error = %e, "Failed to reload config, keeping current backends");
        }
    }
}

fn apply_backends(handle: &ServiceHandle, config: &BalancerConfig) {
    if let Err(e) = handle.reload_backends(&config.backends) {
        tracing::error!(error = %e, "Backend reload failed");
    }
}
