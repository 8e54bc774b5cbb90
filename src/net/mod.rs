//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, pick backend, issue non-blocking connect)
//!     → registry.rs (both descriptors registered under one pair)
//!     → reactor.rs (readiness events routed to pair + side)
//!     → connection.rs (state machine, interest management)
//!     → relay.rs (bounded per-direction buffering)
//!
//! Connection States:
//!     Accepted → Connecting → Proxying → HalfClosed → Closing → Closed
//! ```
//!
//! # Design Decisions
//! - One readiness set per reactor; reactors share only the backend pool
//! - Backpressure by withholding reads, never by growing buffers
//! - Every error below the reactor is contained to its pair

pub mod connection;
pub mod listener;
pub mod reactor;
pub mod registry;
pub mod relay;

pub use connection::{ConnectionId, ConnectionPair, ConnectionState, Direction, Side};
pub use listener::{ListenerError, ListenerTransport, ReuseMode};
pub use reactor::{Reactor, ReactorError, ReactorHandle, ReactorSettings, ReactorStats, ShutdownMode, StatsSnapshot};
