//! One direction of byte flow between two sockets.
//!
//! # Responsibilities
//! - Read from the source side in bounded chunks
//! - Run the framing policy over what was read
//! - Hold what the sink has not yet accepted
//!
//! # Design Decisions
//! - Generic over `Read`/`Write` so the flow-control rules are testable
//!   without sockets
//! - A full outbound buffer stops reading from the source; that is the only
//!   backpressure mechanism and it bounds memory per direction

use std::io::{self, Read, Write};

use bytes::{Buf, BytesMut};

use crate::error::ProxyError;
use crate::protocol::ProtocolError;

/// Buffers and end-of-stream flags for one direction.
#[derive(Debug)]
pub struct Channel {
    /// Read from the source, not yet consumed by the protocol.
    pending: BytesMut,
    /// Consumed, waiting for the sink to accept it.
    outbound: BytesMut,
    max_buffer: usize,
    max_pending: usize,
    source_closed: bool,
    sink_shut: bool,
    relayed: u64,
}

impl Channel {
    pub fn new(max_buffer: usize, max_pending: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            outbound: BytesMut::new(),
            max_buffer: max_buffer.max(1),
            max_pending: max_pending.max(1),
            source_closed: false,
            sink_shut: false,
            relayed: 0,
        }
    }

    /// True while the source may be read without exceeding either bound.
    pub fn wants_read(&self) -> bool {
        !self.source_closed
            && self.outbound.len() < self.max_buffer
            && self.pending.len() < self.max_pending
    }

    pub fn wants_write(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn buffered(&self) -> usize {
        self.outbound.len() + self.pending.len()
    }

    pub fn source_closed(&self) -> bool {
        self.source_closed
    }

    /// Source hit EOF and the sink has received everything consumed.
    pub fn is_drained(&self) -> bool {
        self.source_closed && self.outbound.is_empty()
    }

    pub fn sink_shut(&self) -> bool {
        self.sink_shut
    }

    pub fn mark_sink_shut(&mut self) {
        self.sink_shut = true;
    }

    /// Bytes handed to the sink so far.
    pub fn relayed(&self) -> u64 {
        self.relayed
    }

    /// Read until the source would block, reaches EOF, or the buffers are full.
    ///
    /// Returns the number of bytes read. Partial frames still pending when the
    /// source reaches EOF are discarded.
    pub fn fill<R, F>(&mut self, source: &mut R, chunk: usize, mut consume: F) -> Result<usize, ProxyError>
    where
        R: Read,
        F: FnMut(&[u8], &mut BytesMut) -> Result<usize, ProtocolError>,
    {
        let mut total = 0;
        let mut scratch = vec![0u8; chunk.max(1)];

        while self.wants_read() {
            let room = (self.max_buffer - self.outbound.len()).min(scratch.len());
            match source.read(&mut scratch[..room]) {
                Ok(0) => {
                    self.source_closed = true;
                    if !self.pending.is_empty() {
                        tracing::debug!(discarded = self.pending.len(), "Partial frame dropped at EOF");
                        self.pending.clear();
                    }
                    break;
                }
                Ok(n) => {
                    total += n;
                    self.pending.extend_from_slice(&scratch[..n]);
                    let consumed = consume(&self.pending, &mut self.outbound)?;
                    self.pending.advance(consumed);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ProxyError::from_io(e)),
            }
        }
        Ok(total)
    }

    /// Write buffered bytes until the sink would block or the buffer is empty.
    pub fn flush<W: Write>(&mut self, sink: &mut W) -> Result<usize, ProxyError> {
        let mut total = 0;
        while !self.outbound.is_empty() {
            match sink.write(&self.outbound) {
                Ok(0) => return Err(ProxyError::PeerClosed),
                Ok(n) => {
                    self.outbound.advance(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ProxyError::from_io(e)),
            }
        }
        self.relayed += total as u64;
        Ok(total)
    }
}
