//! Backend pool management.
//!
//! # Responsibilities
//! - Own the ordered, duplicate-free set of backends
//! - Apply the load balancing strategy to select a backend
//! - Provide connection guards for tracking
//!
//! # Design Decisions
//! - Membership is an `ArcSwap`ed vector: readers on the accept path never
//!   lock, administrative changes publish a new vector
//! - Health lives in per-backend atomics written only by the monitor
//! - Removing a backend never touches connections already using it; their
//!   guards keep the `Backend` alive until they close

use std::io;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::{BackendConfig, StrategyKind};
use crate::error::ProxyError;
use crate::load_balancer::{
    backend::{Backend, BackendConnectionGuard, Endpoint, HealthState},
    create_load_balancer, LoadBalancer,
};

/// Shared handle to the backend pool. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct BackendPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    members: ArcSwap<Vec<Arc<Backend>>>,
    strategy: Box<dyn LoadBalancer>,
}

impl Default for BackendPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendPool {
    /// Create an empty round-robin pool.
    pub fn new() -> Self {
        Self::with_strategy(create_load_balancer(StrategyKind::RoundRobin))
    }

    pub fn with_strategy(strategy: Box<dyn LoadBalancer>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                members: ArcSwap::from_pointee(Vec::new()),
                strategy,
            }),
        }
    }

    /// Build a pool from configuration, resolving every backend address.
    pub fn from_config(configs: &[BackendConfig], strategy: StrategyKind) -> io::Result<Self> {
        let pool = Self::with_strategy(create_load_balancer(strategy));
        for config in configs {
            let endpoint = Endpoint::resolve(&config.address)?;
            if !pool.add_backend(Backend::with_limits(
                endpoint,
                config.name.clone(),
                config.max_connections,
            )) {
                tracing::warn!(backend = %endpoint, "Duplicate backend ignored");
            }
        }
        Ok(pool)
    }

    /// Add an endpoint with default limits. Returns false if it was already present.
    pub fn add(&self, endpoint: Endpoint) -> bool {
        self.add_backend(Backend::new(endpoint))
    }

    /// Add a backend unless its endpoint is already a member.
    pub fn add_backend(&self, backend: Backend) -> bool {
        let backend = Arc::new(backend);
        let mut inserted = false;
        self.inner.members.rcu(|current| {
            inserted = !current.iter().any(|b| b.endpoint() == backend.endpoint());
            let mut next = Vec::clone(current);
            if inserted {
                next.push(backend.clone());
            }
            next
        });
        if inserted {
            tracing::info!(backend = %backend.endpoint(), "Backend added");
        }
        inserted
    }

    /// Remove an endpoint. Connections already using it are left to drain.
    pub fn remove(&self, endpoint: Endpoint) -> bool {
        let mut removed = false;
        self.inner.members.rcu(|current| {
            let next: Vec<_> = current
                .iter()
                .filter(|b| b.endpoint() != endpoint)
                .cloned()
                .collect();
            removed = next.len() != current.len();
            next
        });
        if removed {
            tracing::info!(backend = %endpoint, "Backend removed");
        }
        removed
    }

    /// Lazy view over the members at the time of the call.
    pub fn list_all(&self) -> PoolSnapshot {
        PoolSnapshot {
            members: self.inner.members.load_full(),
        }
    }

    pub fn clear(&self) {
        self.inner.members.store(Arc::new(Vec::new()));
        tracing::info!("Backend pool cleared");
    }

    /// Union with `other`. Existing members keep their status; members new to
    /// this pool start Up regardless of their status in `other`.
    pub fn extend(&self, other: &BackendPool) {
        for backend in other.list_all().backends() {
            self.add_backend(backend.fresh());
        }
    }

    /// Make membership equal to `desired`: new endpoints are added through
    /// [`extend`](Self::extend), absent ones removed. Returns (added, removed).
    pub fn reconcile(&self, desired: &BackendPool) -> (usize, usize) {
        let added = desired
            .list_all()
            .iter()
            .filter(|s| !self.contains(s.endpoint))
            .count();
        self.extend(desired);

        let stale: Vec<Endpoint> = self
            .list_all()
            .iter()
            .map(|s| s.endpoint)
            .filter(|endpoint| !desired.contains(*endpoint))
            .collect();
        for endpoint in &stale {
            self.remove(*endpoint);
        }
        (added, stale.len())
    }

    pub fn len(&self) -> usize {
        self.inner.members.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, endpoint: Endpoint) -> bool {
        self.get(endpoint).is_some()
    }

    pub fn get(&self, endpoint: Endpoint) -> Option<Arc<Backend>> {
        self.inner
            .members
            .load()
            .iter()
            .find(|b| b.endpoint() == endpoint)
            .cloned()
    }

    /// Select the next Up backend and reserve a connection slot on it.
    pub fn next_healthy(&self) -> Result<BackendConnectionGuard, ProxyError> {
        let members = self.inner.members.load();
        // A slot can vanish between selection and reservation; give every
        // member one chance before declaring the pool exhausted.
        for _ in 0..members.len() {
            let Some(backend) = self.inner.strategy.next_server(&members) else {
                break;
            };
            if let Some(guard) = backend.try_create_guard() {
                return Ok(guard);
            }
        }
        tracing::debug!(
            members = members.len(),
            strategy = self.inner.strategy.name(),
            "No healthy backend found"
        );
        Err(ProxyError::NoHealthyBackend)
    }
}

/// Status of one member at the time it was yielded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendStatus {
    pub endpoint: Endpoint,
    pub status: HealthState,
    pub active_connections: usize,
}

/// Membership captured by [`BackendPool::list_all`].
///
/// Iteration reads each backend's status as it is reached, never blocks, and
/// can be restarted any number of times.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    members: Arc<Vec<Arc<Backend>>>,
}

impl PoolSnapshot {
    pub fn iter(&self) -> SnapshotIter {
        SnapshotIter {
            members: self.members.clone(),
            index: 0,
        }
    }

    pub fn backends(&self) -> impl Iterator<Item = &Arc<Backend>> + '_ {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl IntoIterator for PoolSnapshot {
    type Item = BackendStatus;
    type IntoIter = SnapshotIter;

    fn into_iter(self) -> Self::IntoIter {
        SnapshotIter {
            members: self.members,
            index: 0,
        }
    }
}

impl IntoIterator for &PoolSnapshot {
    type Item = BackendStatus;
    type IntoIter = SnapshotIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotIter {
    members: Arc<Vec<Arc<Backend>>>,
    index: usize,
}

impl Iterator for SnapshotIter {
    type Item = BackendStatus;

    fn next(&mut self) -> Option<Self::Item> {
        let backend = self.members.get(self.index)?;
        self.index += 1;
        Some(BackendStatus {
            endpoint: backend.endpoint(),
            status: backend.state(),
            active_connections: backend.active_connections(),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.members.len() - self.index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for SnapshotIter {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::state::Thresholds;

    fn ep(port: u16) -> Endpoint {
        Endpoint::new("127.0.0.1".parse().unwrap(), port)
    }

    fn take_down(pool: &BackendPool, endpoint: Endpoint) {
        let backend = pool.get(endpoint).unwrap();
        for _ in 0..3 {
            backend.record_probe(false, Thresholds::default());
        }
        assert!(!backend.is_up());
    }

    #[test]
    fn add_is_idempotent() {
        let pool = BackendPool::new();
        assert!(pool.add(ep(1)));
        assert!(!pool.add(ep(1)));
        assert_eq!(pool.len(), 1);
        assert!(pool.list_all().iter().all(|s| s.status == HealthState::Up));
    }

    #[test]
    fn list_all_is_restartable_and_ordered() {
        let pool = BackendPool::new();
        pool.add(ep(3));
        pool.add(ep(1));
        let snapshot = pool.list_all();

        let first: Vec<_> = snapshot.iter().map(|s| s.endpoint).collect();
        let second: Vec<_> = snapshot.iter().map(|s| s.endpoint).collect();
        assert_eq!(first, vec![ep(3), ep(1)]);
        assert_eq!(first, second);

        // Later changes do not disturb an existing snapshot.
        pool.clear();
        assert_eq!(snapshot.iter().count(), 2);
        assert!(pool.list_all().is_empty());
    }

    #[test]
    fn round_robin_scenario_a_b_a() {
        let pool = BackendPool::new();
        pool.add(ep(1));
        pool.add(ep(2));

        let picks: Vec<_> = (0..3)
            .map(|_| pool.next_healthy().unwrap().endpoint())
            .collect();
        assert_eq!(picks, vec![ep(1), ep(2), ep(1)]);
    }

    #[test]
    fn exhausted_pool_fails_deterministically() {
        let pool = BackendPool::new();
        assert!(matches!(pool.next_healthy(), Err(ProxyError::NoHealthyBackend)));

        pool.add(ep(1));
        take_down(&pool, ep(1));
        for _ in 0..3 {
            assert!(matches!(pool.next_healthy(), Err(ProxyError::NoHealthyBackend)));
        }
    }

    #[test]
    fn remove_leaves_in_flight_guard_alive() {
        let pool = BackendPool::new();
        pool.add(ep(1));
        let guard = pool.next_healthy().unwrap();

        assert!(pool.remove(ep(1)));
        assert!(!pool.remove(ep(1)));
        assert_eq!(guard.endpoint(), ep(1));
        assert_eq!(guard.active_connections(), 1);
    }

    #[test]
    fn extend_preserves_status_and_adds_new_as_up() {
        let pool = BackendPool::new();
        pool.add(ep(1));
        take_down(&pool, ep(1));

        let other = BackendPool::new();
        other.add(ep(1));
        other.add(ep(2));
        take_down(&other, ep(2));

        pool.extend(&other);
        let statuses: Vec<_> = pool.list_all().into_iter().map(|s| (s.endpoint, s.status)).collect();
        assert_eq!(
            statuses,
            vec![(ep(1), HealthState::Down), (ep(2), HealthState::Up)]
        );
    }

    #[test]
    fn reconcile_adds_and_removes() {
        let pool = BackendPool::new();
        pool.add(ep(1));
        pool.add(ep(2));
        take_down(&pool, ep(2));

        let desired = BackendPool::new();
        desired.add(ep(2));
        desired.add(ep(3));

        assert_eq!(pool.reconcile(&desired), (1, 1));
        let statuses: Vec<_> = pool.list_all().into_iter().map(|s| (s.endpoint, s.status)).collect();
        assert_eq!(
            statuses,
            vec![(ep(2), HealthState::Down), (ep(3), HealthState::Up)]
        );
        assert_eq!(pool.reconcile(&desired), (0, 0));
    }

    #[test]
    fn saturated_backends_are_skipped() {
        let pool = BackendPool::new();
        pool.add_backend(Backend::with_limits(ep(1), None, Some(1)));
        pool.add(ep(2));

        let first = pool.next_healthy().unwrap();
        assert_eq!(first.endpoint(), ep(1));
        assert_eq!(pool.next_healthy().unwrap().endpoint(), ep(2));
        assert_eq!(pool.next_healthy().unwrap().endpoint(), ep(2));
        drop(first);
        assert_eq!(pool.next_healthy().unwrap().endpoint(), ep(1));
    }

    #[test]
    fn from_config_drops_duplicates() {
        let configs = vec![
            BackendConfig::new("127.0.0.1:9001"),
            BackendConfig::new("127.0.0.1:9001"),
            BackendConfig::new("127.0.0.1:9002"),
        ];
        let pool = BackendPool::from_config(&configs, StrategyKind::RoundRobin).unwrap();
        assert_eq!(pool.len(), 2);
    }
}
