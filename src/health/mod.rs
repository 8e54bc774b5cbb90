//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Periodic timer
//!     → Probe each backend (probe.rs)
//!     → Update debounce counters (state.rs)
//!
//! State machine (state.rs):
//!     Up ←→ Down
//!     With thresholds to prevent flapping
//! ```
//!
//! # Design Decisions
//! - Probing runs on its own runtime thread, never on a reactor thread
//! - A failed backend connect on the data path does not count as a probe
//! - Health state is per-backend, not per-pool

pub mod active;
pub mod probe;
pub mod state;

pub use active::{CheckSummary, HealthMonitor};
pub use probe::{HttpProbe, Probe, ProbeError, TcpConnectProbe};
pub use state::{Thresholds, Transition};
