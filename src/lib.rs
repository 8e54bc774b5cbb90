//! Layer-4 TCP load balancer library.

pub mod config;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod protocol;
pub mod service;

pub use config::BalancerConfig;
pub use error::ProxyError;
pub use lifecycle::Shutdown;
pub use service::{ReloadSummary, Service, ServiceError, ServiceHandle};
