//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals to internal events
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Escalation on repeated SIGTERM/SIGINT is left to [`Shutdown`](super::Shutdown)
//! - SIGHUP triggers a backend reload, not shutdown

use std::io;

/// What a received signal asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Shutdown,
    Reload,
}

#[cfg(unix)]
pub struct Signals {
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    /// Install the handlers. Must be called inside a Tokio runtime.
    pub fn install() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    /// Wait for the next signal.
    pub async fn recv(&mut self) -> SignalEvent {
        tokio::select! {
            _ = self.terminate.recv() => {
                tracing::info!(signal = "SIGTERM", "Signal received");
                SignalEvent::Shutdown
            }
            _ = self.interrupt.recv() => {
                tracing::info!(signal = "SIGINT", "Signal received");
                SignalEvent::Shutdown
            }
            _ = self.hangup.recv() => {
                tracing::info!(signal = "SIGHUP", "Signal received");
                SignalEvent::Reload
            }
        }
    }
}

#[cfg(not(unix))]
pub struct Signals;

#[cfg(not(unix))]
impl Signals {
    pub fn install() -> io::Result<Self> {
        Ok(Self)
    }

    pub async fn recv(&mut self) -> SignalEvent {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        tracing::info!(signal = "ctrl-c", "Signal received");
        SignalEvent::Shutdown
    }
}
