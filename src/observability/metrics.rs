//! Metrics collection and exposition.
//!
//! # Metrics
//! - `balancer_connections_accepted_total` (counter)
//! - `balancer_connections_rejected_total` (counter): by reason
//! - `balancer_connections_closed_total` (counter)
//! - `balancer_active_connections` (gauge): pairs in the registry
//! - `balancer_bytes_relayed_total` (counter): by direction
//! - `balancer_backend_up` (gauge): 1=up, 0=down, by backend
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a cheap no-op
//! - Prometheus exposition is opt-in via configuration

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus exporter with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_accepted() {
    metrics::counter!("balancer_connections_accepted_total").increment(1);
}

pub fn record_rejected(reason: &'static str) {
    metrics::counter!("balancer_connections_rejected_total", "reason" => reason).increment(1);
}

pub fn record_closed() {
    metrics::counter!("balancer_connections_closed_total").increment(1);
}

pub fn set_active_connections(count: usize) {
    metrics::gauge!("balancer_active_connections").set(count as f64);
}

pub fn record_bytes(direction: &'static str, bytes: usize) {
    metrics::counter!("balancer_bytes_relayed_total", "direction" => direction)
        .increment(bytes as u64);
}

pub fn record_backend_health(backend: &str, up: bool) {
    metrics::gauge!("balancer_backend_up", "backend" => backend.to_string())
        .set(if up { 1.0 } else { 0.0 });
}
