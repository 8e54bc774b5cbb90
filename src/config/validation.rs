//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (sizes and intervals > 0, thresholds ≥ 1)
//! - Detect unparsable and duplicate backend addresses
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: BalancerConfig → Result<(), Vec<ValidationError>>
//! - No DNS lookups here; hostnames are resolved when the pool is built

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

use crate::config::schema::BalancerConfig;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("listener.address `{0}` is not an IP address")]
    InvalidListenAddress(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("proxy.max_buffer ({max_buffer}) must be at least proxy.chunk_size ({chunk_size})")]
    BufferSmallerThanChunk { max_buffer: usize, chunk_size: usize },

    #[error("health_check.path `{0}` must start with '/'")]
    InvalidProbePath(String),

    #[error("backend address `{0}` is not host:port")]
    InvalidBackendAddress(String),

    #[error("backend `{0}` is listed more than once")]
    DuplicateBackend(String),

    #[error("backend `{0}` has max_connections = 0")]
    ZeroBackendLimit(String),

    #[error("observability.metrics_address `{0}` is not a socket address")]
    InvalidMetricsAddress(String),

    #[error("observability.log_level `{0}` is not one of trace, debug, info, warn, error")]
    InvalidLogLevel(String),
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

pub fn validate_config(config: &BalancerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.address.parse::<IpAddr>().is_err() {
        errors.push(ValidationError::InvalidListenAddress(
            config.listener.address.clone(),
        ));
    }
    if config.listener.backlog == 0 {
        errors.push(ValidationError::Zero("listener.backlog"));
    }
    if config.listener.instances == 0 {
        errors.push(ValidationError::Zero("listener.instances"));
    }

    if config.proxy.chunk_size == 0 {
        errors.push(ValidationError::Zero("proxy.chunk_size"));
    }
    if config.proxy.max_frame == 0 {
        errors.push(ValidationError::Zero("proxy.max_frame"));
    }
    if config.proxy.max_buffer < config.proxy.chunk_size {
        errors.push(ValidationError::BufferSmallerThanChunk {
            max_buffer: config.proxy.max_buffer,
            chunk_size: config.proxy.chunk_size,
        });
    }

    if config.timeouts.connect_ms == 0 {
        errors.push(ValidationError::Zero("timeouts.connect_ms"));
    }
    if config.timeouts.poll_interval_ms == 0 {
        errors.push(ValidationError::Zero("timeouts.poll_interval_ms"));
    }

    let hc = &config.health_check;
    if hc.interval_ms == 0 {
        errors.push(ValidationError::Zero("health_check.interval_ms"));
    }
    if hc.timeout_ms == 0 {
        errors.push(ValidationError::Zero("health_check.timeout_ms"));
    }
    if hc.unhealthy_threshold == 0 {
        errors.push(ValidationError::Zero("health_check.unhealthy_threshold"));
    }
    if hc.healthy_threshold == 0 {
        errors.push(ValidationError::Zero("health_check.healthy_threshold"));
    }
    if !hc.path.starts_with('/') {
        errors.push(ValidationError::InvalidProbePath(hc.path.clone()));
    }

    let mut seen = HashSet::new();
    for backend in &config.backends {
        let address = backend.address.trim();
        if !is_host_port(address) {
            errors.push(ValidationError::InvalidBackendAddress(address.to_string()));
        } else if !seen.insert(address.to_ascii_lowercase()) {
            errors.push(ValidationError::DuplicateBackend(address.to_string()));
        }
        if backend.max_connections == Some(0) {
            errors.push(ValidationError::ZeroBackendLimit(address.to_string()));
        }
    }

    let obs = &config.observability;
    if obs.metrics_enabled && obs.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidMetricsAddress(
            obs.metrics_address.clone(),
        ));
    }
    if !LOG_LEVELS.contains(&obs.log_level.to_ascii_lowercase().as_str()) {
        errors.push(ValidationError::InvalidLogLevel(obs.log_level.clone()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// `host:port` or `[v6]:port` with a non-zero port.
fn is_host_port(address: &str) -> bool {
    if address.parse::<SocketAddr>().is_ok() {
        return !address.ends_with(":0");
    }
    match address.rsplit_once(':') {
        Some((host, port)) => {
            !host.is_empty()
                && !host.contains(':')
                && !host.chars().any(char::is_whitespace)
                && port.parse::<u16>().is_ok_and(|p| p != 0)
        }
        None => false,
    }
}
