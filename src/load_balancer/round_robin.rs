//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{backend::Backend, is_selectable, LoadBalancer};

/// Round-robin selector.
///
/// Holds the position just after the last selected index; each call scans
/// forward from there and skips members that are down or saturated.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn next_server(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        let len = backends.len();
        if len == 0 {
            return None;
        }

        let mut start = self.next.load(Ordering::Relaxed);
        loop {
            let found = (0..len)
                .map(|i| (start + i) % len)
                .find(|&index| is_selectable(&backends[index]))?;

            // Another reactor may have advanced the cursor since we loaded it.
            match self.next.compare_exchange_weak(
                start,
                found + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(backends[found].clone()),
                Err(actual) => start = actual,
            }
        }
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}
