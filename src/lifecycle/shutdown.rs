//! Shutdown coordination.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::broadcast;

use crate::net::ShutdownMode;

/// Coordinator for escalating shutdown.
///
/// The first request asks for a drain; every later one asks for immediate
/// termination. Long-running tasks subscribe to the broadcast.
#[derive(Debug)]
pub struct Shutdown {
    tx: broadcast::Sender<ShutdownMode>,
    requests: AtomicUsize,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(4);
        Self {
            tx,
            requests: AtomicUsize::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownMode> {
        self.tx.subscribe()
    }

    /// Escalate: drain on the first call, terminate afterwards.
    pub fn request(&self) -> ShutdownMode {
        let mode = if self.requests.load(Ordering::SeqCst) == 0 {
            ShutdownMode::Drain
        } else {
            ShutdownMode::Terminate
        };
        self.trigger(mode);
        mode
    }

    /// Broadcast a specific mode.
    pub fn trigger(&self, mode: ShutdownMode) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(mode);
    }

    pub fn is_requested(&self) -> bool {
        self.requests.load(Ordering::SeqCst) > 0
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
