//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Client accepted
//!     → pool.rs (snapshot of current members)
//!     → Apply load balancing algorithm:
//!         - round_robin.rs (rotate through backends)
//!         - least_conn.rs (pick backend with fewest connections)
//!     → backend.rs (acquire connection guard)
//!     → Return guarded backend or NoHealthyBackend
//! ```
//!
//! # Design Decisions
//! - Strategies only choose; the pool owns membership and health
//! - Down and saturated backends are never selected
//! - Selection state is pool-wide so fairness holds across connections

use std::fmt::Debug;
use std::sync::Arc;

use crate::config::StrategyKind;

pub mod backend;
pub mod least_conn;
pub mod pool;
pub mod round_robin;

pub use backend::{Backend, BackendConnectionGuard, Endpoint, HealthState};
pub use pool::{BackendPool, BackendStatus, PoolSnapshot};

/// A backend selection strategy.
pub trait LoadBalancer: Send + Sync + Debug {
    /// Pick one selectable backend, or `None` when no member qualifies.
    fn next_server(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>>;

    fn name(&self) -> &'static str;
}

/// Whether a backend may receive a new connection.
pub fn is_selectable(backend: &Backend) -> bool {
    backend.is_up() && backend.has_capacity()
}

pub fn create_load_balancer(kind: StrategyKind) -> Box<dyn LoadBalancer> {
    match kind {
        StrategyKind::RoundRobin => Box::new(round_robin::RoundRobin::new()),
        StrategyKind::LeastConnections => Box::new(least_conn::LeastConnections::new()),
    }
}
