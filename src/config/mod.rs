//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → BalancerConfig (validated, immutable)
//!     → Service (listener, pool, monitor, reactor settings)
//!
//! On reload (file change or SIGHUP):
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → backend list reconciled into the running pool
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Only backends are hot-reloadable; listener and timeouts need a restart

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    BackendConfig, BalancerConfig, HealthCheckConfig, ListenerConfig, LogFormat,
    ObservabilityConfig, ProbeKind, ProtocolKind, ProxyConfig, StrategyKind, TimeoutConfig,
};
pub use validation::{validate_config, ValidationError};
pub use watcher::ConfigWatcher;
