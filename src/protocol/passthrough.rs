//! Verbatim byte forwarding.

use bytes::BytesMut;

use crate::protocol::{ProtocolError, ProxyProtocol};

/// Forwards every byte unmodified, in order, without inspection.
#[derive(Debug, Clone)]
pub struct PassthroughProtocol {
    chunk_size: usize,
}

impl PassthroughProtocol {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Default for PassthroughProtocol {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl ProxyProtocol for PassthroughProtocol {
    fn on_client_readable(
        &mut self,
        input: &[u8],
        out: &mut BytesMut,
    ) -> Result<usize, ProtocolError> {
        out.extend_from_slice(input);
        Ok(input.len())
    }

    fn on_server_readable(
        &mut self,
        input: &[u8],
        out: &mut BytesMut,
    ) -> Result<usize, ProtocolError> {
        out.extend_from_slice(input);
        Ok(input.len())
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}
