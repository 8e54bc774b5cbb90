//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Request → Stop accepting → Drain pairs → Exit
//!     Second request → Close every pair → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown request
//!     SIGHUP → Backend reload
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, stop health monitor
//! - Drain has a deadline: remaining pairs are closed when it passes

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::{SignalEvent, Signals};
