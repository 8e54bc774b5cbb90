//! Per-connection framing policy.
//!
//! # Data Flow
//! ```text
//! Bytes read from one side
//!     → pending input of that side
//!     → ProxyProtocol decides how much is consumed
//!     → consumed output appended to the buffer toward the peer
//! ```
//!
//! # Design Decisions
//! - The reactor only sees "bytes consumed" and "bytes ready for the peer"
//! - Unconsumed input is kept and re-presented once more bytes arrive
//! - One protocol instance per connection, built by a factory at accept time

use std::fmt::Debug;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;

use crate::config::{ProtocolKind, ProxyConfig};

pub mod framed;
pub mod passthrough;

pub use framed::{LengthPrefixedProtocol, LineProtocol};
pub use passthrough::PassthroughProtocol;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },
}

/// Decides how bytes move between the two sides of a connection.
pub trait ProxyProtocol: Send + Debug {
    /// Bytes arrived from the client. Append what the backend should receive to
    /// `out` and return how many bytes of `input` were consumed.
    fn on_client_readable(&mut self, input: &[u8], out: &mut BytesMut)
        -> Result<usize, ProtocolError>;

    /// Bytes arrived from the backend; same contract toward the client.
    fn on_server_readable(&mut self, input: &[u8], out: &mut BytesMut)
        -> Result<usize, ProtocolError>;

    /// Upper bound for a single socket read.
    fn chunk_size(&self) -> usize;

    /// Largest amount of unconsumed input this protocol may hold per side.
    fn max_pending(&self) -> usize {
        self.chunk_size()
    }
}

/// Builds one protocol instance per accepted connection.
pub type ProtocolFactory = Arc<dyn Fn() -> Box<dyn ProxyProtocol> + Send + Sync>;

/// Factory for the protocol selected in configuration.
pub fn factory(config: &ProxyConfig) -> ProtocolFactory {
    let chunk_size = config.chunk_size;
    let max_frame = config.max_frame;
    match config.protocol {
        ProtocolKind::Passthrough => Arc::new(move || {
            Box::new(PassthroughProtocol::new(chunk_size)) as Box<dyn ProxyProtocol>
        }),
        ProtocolKind::Line => {
            Arc::new(move || Box::new(LineProtocol::new(chunk_size, max_frame)) as Box<dyn ProxyProtocol>)
        }
        ProtocolKind::LengthPrefixed => Arc::new(move || {
            Box::new(LengthPrefixedProtocol::new(chunk_size, max_frame)) as Box<dyn ProxyProtocol>
        }),
    }
}
