//! Least Connections load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{backend::Backend, is_selectable, LoadBalancer};

/// Least connections selector.
/// Selects the selectable backend with the minimum number of active connections.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnections {
    fn next_server(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        // In case of tie, the first one is selected (stability)
        backends
            .iter()
            .filter(|b| is_selectable(b))
            .min_by_key(|b| b.active_connections())
            .cloned()
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}
