//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the balancer.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the TCP balancer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BalancerConfig {
    /// Listener configuration (address, port, backlog).
    pub listener: ListenerConfig,

    /// Relay behaviour (protocol, buffer sizes, selection strategy).
    pub proxy: ProxyConfig,

    /// Backend server definitions.
    pub backends: Vec<BackendConfig>,

    /// Health check settings.
    pub health_check: HealthCheckConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Address to bind (e.g., "0.0.0.0").
    pub address: String,

    /// Port to bind. Zero picks an ephemeral port.
    pub port: u16,

    /// Listen backlog passed to `listen(2)`.
    pub backlog: u32,

    /// Number of reactor threads accepting on the same port.
    pub instances: usize,

    /// Disable Nagle on both sides of every relayed connection.
    pub nodelay: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8080,
            backlog: 128,
            instances: 1,
            nodelay: true,
        }
    }
}

impl ListenerConfig {
    /// `address:port` as a single string, suitable for parsing.
    pub fn bind_address(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

/// Framing applied to the byte stream of each connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    /// Forward bytes verbatim.
    #[default]
    Passthrough,
    /// Forward complete newline-terminated lines.
    Line,
    /// Forward complete frames carrying a 4-byte big-endian length prefix.
    LengthPrefixed,
}

/// Backend selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    RoundRobin,
    LeastConnections,
}

/// Relay configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Per-connection framing policy.
    pub protocol: ProtocolKind,

    /// Backend selection strategy.
    pub strategy: StrategyKind,

    /// Maximum bytes read from a socket per read call.
    pub chunk_size: usize,

    /// Per-direction buffer bound; reading stops while a buffer is at this size.
    pub max_buffer: usize,

    /// Largest frame accepted by the framed protocols.
    pub max_frame: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolKind::Passthrough,
            strategy: StrategyKind::RoundRobin,
            chunk_size: 4096,
            max_buffer: 64 * 1024,
            max_frame: 64 * 1024,
        }
    }
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BackendConfig {
    /// Optional label used in logs.
    #[serde(default)]
    pub name: Option<String>,

    /// Backend address (e.g., "127.0.0.1:3000" or "db.internal:5432").
    pub address: String,

    /// Maximum concurrent connections to this backend (unlimited when absent).
    #[serde(default)]
    pub max_connections: Option<usize>,
}

impl BackendConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
            max_connections: None,
        }
    }
}

/// Probe flavour used by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// Successful TCP handshake means up.
    #[default]
    Tcp,
    /// `GET {path}` answering 2xx means up.
    Http,
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    /// Probe flavour.
    pub kind: ProbeKind,

    /// Health check interval in milliseconds.
    pub interval_ms: u64,

    /// Per-probe timeout in milliseconds.
    pub timeout_ms: u64,

    /// Path to probe for HTTP health checks.
    pub path: String,

    /// Number of consecutive failures before marking down.
    pub unhealthy_threshold: u32,

    /// Number of consecutive successes before marking up.
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: ProbeKind::Tcp,
            interval_ms: 2000,
            timeout_ms: 1000,
            path: "/health".to_string(),
            unhealthy_threshold: 3,
            healthy_threshold: 1,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Timeout configuration for the reactor.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Backend connect timeout in milliseconds.
    pub connect_ms: u64,

    /// Idle timeout for established pairs in seconds (0 disables it).
    pub idle_secs: u64,

    /// Upper bound of a single readiness wait in milliseconds.
    pub poll_interval_ms: u64,

    /// How long a graceful shutdown waits for pairs to drain, in seconds.
    pub drain_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 3000,
            idle_secs: 0,
            poll_interval_ms: 100,
            drain_secs: 30,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn idle(&self) -> Option<Duration> {
        (self.idle_secs > 0).then(|| Duration::from_secs(self.idle_secs))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_secs)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Human-readable or JSON lines.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: BalancerConfig = toml::from_str(
            r#"
            [[backends]]
            address = "127.0.0.1:9001"
            "#,
        )
        .unwrap();

        assert_eq!(config.listener.port, 8080);
        assert_eq!(config.proxy.chunk_size, 4096);
        assert_eq!(config.proxy.protocol, ProtocolKind::Passthrough);
        assert_eq!(config.health_check.unhealthy_threshold, 3);
        assert_eq!(config.health_check.healthy_threshold, 1);
        assert_eq!(config.backends, vec![BackendConfig::new("127.0.0.1:9001")]);
    }

    #[test]
    fn enums_use_snake_case() {
        let config: BalancerConfig = toml::from_str(
            r#"
            [proxy]
            protocol = "length_prefixed"
            strategy = "least_connections"

            [health_check]
            kind = "http"

            [observability]
            log_format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.proxy.protocol, ProtocolKind::LengthPrefixed);
        assert_eq!(config.proxy.strategy, StrategyKind::LeastConnections);
        assert_eq!(config.health_check.kind, ProbeKind::Http);
        assert_eq!(config.observability.log_format, LogFormat::Json);
    }

    #[test]
    fn bind_address_brackets_ipv6() {
        let mut listener = ListenerConfig::default();
        listener.address = "::1".into();
        listener.port = 9000;
        assert_eq!(listener.bind_address(), "[::1]:9000");
    }

    #[test]
    fn zero_idle_disables_timeout() {
        assert_eq!(TimeoutConfig::default().idle(), None);
    }
}
