//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON lines)
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Design Decisions
//! - Structured fields (`connection_id`, `backend`, `peer_addr`) on every event
//! - Metric updates are no-ops until an exporter is installed

pub mod logging;
pub mod metrics;
