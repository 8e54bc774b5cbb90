//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe every pool member
//! - Feed outcomes through the debounce thresholds
//! - Expose the resulting up/down view

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::broadcast;
use tokio::time;

use crate::config::HealthCheckConfig;
use crate::health::probe::Probe;
use crate::health::state::{Thresholds, Transition};
use crate::load_balancer::{BackendPool, Endpoint, HealthState};
use crate::net::ShutdownMode;
use crate::observability::metrics;

/// Outcome counts of one probe round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckSummary {
    pub probed: usize,
    pub failed: usize,
    pub transitions: usize,
}

#[derive(Debug)]
pub struct HealthMonitor {
    pool: BackendPool,
    probe: Arc<dyn Probe>,
    thresholds: Thresholds,
    interval: Duration,
    timeout: Duration,
}

impl HealthMonitor {
    pub fn new(pool: BackendPool, probe: Arc<dyn Probe>, config: &HealthCheckConfig) -> Self {
        Self {
            pool,
            probe,
            thresholds: Thresholds::from(config),
            interval: config.interval(),
            timeout: config.timeout(),
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Probe on a fixed interval until the shutdown signal fires.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<ShutdownMode>) {
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            probe = self.probe.name(),
            unhealthy_threshold = self.thresholds.unhealthy(),
            healthy_threshold = self.thresholds.healthy(),
            "Health monitor starting"
        );

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Run one probe round over the current members.
    ///
    /// Probes run concurrently; outcomes are applied in pool order.
    pub async fn check_all(&self) -> CheckSummary {
        let snapshot = self.pool.list_all();
        let backends: Vec<_> = snapshot.backends().cloned().collect();

        let outcomes = join_all(backends.iter().map(|backend| {
            let endpoint = backend.endpoint();
            async move {
                match time::timeout(self.timeout, self.probe.probe(endpoint)).await {
                    Ok(up) => up,
                    Err(_) => {
                        tracing::debug!(backend = %endpoint, "Probe exceeded timeout");
                        false
                    }
                }
            }
        }))
        .await;

        let mut summary = CheckSummary::default();
        for (backend, up) in backends.iter().zip(outcomes) {
            summary.probed += 1;
            if !up {
                summary.failed += 1;
            }

            match backend.record_probe(up, self.thresholds) {
                Some(Transition::WentDown) => {
                    summary.transitions += 1;
                    tracing::warn!(
                        backend = %backend.label(),
                        threshold = self.thresholds.unhealthy(),
                        "Backend is now down after consecutive probe failures"
                    );
                }
                Some(Transition::WentUp) => {
                    summary.transitions += 1;
                    tracing::info!(
                        backend = %backend.label(),
                        threshold = self.thresholds.healthy(),
                        "Backend is now up"
                    );
                }
                None if !up => {
                    tracing::debug!(
                        backend = %backend.label(),
                        consecutive_failures = backend.consecutive_failures(),
                        "Probe failed"
                    );
                }
                None => {}
            }

            metrics::record_backend_health(&backend.endpoint().to_string(), backend.is_up());
        }

        tracing::debug!(
            probed = summary.probed,
            failed = summary.failed,
            transitions = summary.transitions,
            "Health check round complete"
        );
        summary
    }

    /// Endpoints currently up, read lazily from a membership snapshot.
    pub fn servers_up(&self) -> impl Iterator<Item = Endpoint> {
        self.servers_with(HealthState::Up)
    }

    /// Endpoints currently down, read lazily from a membership snapshot.
    pub fn servers_down(&self) -> impl Iterator<Item = Endpoint> {
        self.servers_with(HealthState::Down)
    }

    fn servers_with(&self, state: HealthState) -> impl Iterator<Item = Endpoint> {
        self.pool
            .list_all()
            .into_iter()
            .filter(move |s| s.status == state)
            .map(|s| s.endpoint)
    }

    /// Zero every counter and mark every member up.
    pub fn reset(&self) {
        for backend in self.pool.list_all().backends() {
            backend.reset();
        }
        tracing::info!(members = self.pool.len(), "Health monitor reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Probe answering from a shared set of endpoints considered down.
    #[derive(Debug, Default)]
    struct ScriptedProbe {
        down: Mutex<HashSet<Endpoint>>,
    }

    impl ScriptedProbe {
        fn set_down(&self, endpoint: Endpoint, down: bool) {
            let mut set = self.down.lock().unwrap();
            if down {
                set.insert(endpoint);
            } else {
                set.remove(&endpoint);
            }
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn probe(&self, endpoint: Endpoint) -> bool {
            !self.down.lock().unwrap().contains(&endpoint)
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn ep(port: u16) -> Endpoint {
        Endpoint::new("127.0.0.1".parse().unwrap(), port)
    }

    fn monitor(pool: &BackendPool) -> (HealthMonitor, Arc<ScriptedProbe>) {
        let probe = Arc::new(ScriptedProbe::default());
        let monitor = HealthMonitor::new(pool.clone(), probe.clone(), &HealthCheckConfig::default());
        (monitor, probe)
    }

    #[tokio::test]
    async fn three_failures_mark_down_then_pool_is_exhausted() {
        let pool = BackendPool::new();
        pool.add(ep(1));
        let (monitor, probe) = monitor(&pool);
        probe.set_down(ep(1), true);

        monitor.check_all().await;
        monitor.check_all().await;
        assert_eq!(monitor.servers_down().count(), 0);

        let summary = monitor.check_all().await;
        assert_eq!(summary.transitions, 1);
        assert_eq!(monitor.servers_down().collect::<Vec<_>>(), vec![ep(1)]);
        assert_eq!(monitor.servers_up().count(), 0);
        assert!(pool.next_healthy().is_err());
    }

    #[tokio::test]
    async fn single_success_recovers() {
        let pool = BackendPool::new();
        pool.add(ep(1));
        pool.add(ep(2));
        let (monitor, probe) = monitor(&pool);
        probe.set_down(ep(2), true);
        for _ in 0..3 {
            monitor.check_all().await;
        }
        assert_eq!(monitor.servers_up().collect::<Vec<_>>(), vec![ep(1)]);

        probe.set_down(ep(2), false);
        monitor.check_all().await;
        assert_eq!(monitor.servers_up().collect::<Vec<_>>(), vec![ep(1), ep(2)]);
    }

    #[tokio::test]
    async fn reset_returns_everything_up() {
        let pool = BackendPool::new();
        pool.add(ep(1));
        pool.add(ep(2));
        let (monitor, probe) = monitor(&pool);
        probe.set_down(ep(1), true);
        probe.set_down(ep(2), true);
        for _ in 0..4 {
            monitor.check_all().await;
        }
        assert_eq!(monitor.servers_down().count(), 2);

        monitor.reset();
        assert_eq!(monitor.servers_up().count(), 2);
        for backend in pool.list_all().backends() {
            assert_eq!(backend.consecutive_failures(), 0);
            assert_eq!(backend.consecutive_successes(), 0);
        }
    }

    #[tokio::test]
    async fn slow_probe_counts_as_failure() {
        #[derive(Debug)]
        struct Stalled;

        #[async_trait]
        impl Probe for Stalled {
            async fn probe(&self, _endpoint: Endpoint) -> bool {
                time::sleep(Duration::from_secs(5)).await;
                true
            }

            fn name(&self) -> &'static str {
                "stalled"
            }
        }

        let pool = BackendPool::new();
        pool.add(ep(1));
        let config = HealthCheckConfig {
            timeout_ms: 20,
            ..HealthCheckConfig::default()
        };
        let monitor = HealthMonitor::new(pool.clone(), Arc::new(Stalled), &config);
        let summary = monitor.check_all().await;
        assert_eq!(summary.failed, 1);
        assert_eq!(pool.get(ep(1)).unwrap().consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let pool = BackendPool::new();
        let (monitor, _probe) = monitor(&pool);
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(Arc::new(monitor).run(rx));
        tx.send(ShutdownMode::Drain).unwrap();
        time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("monitor did not stop")
            .unwrap();
    }
}
