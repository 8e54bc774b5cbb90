//! Message-framed forwarding.
//!
//! Both protocols hold bytes back until a complete message is available and
//! then forward whole messages, so a peer never observes a partial frame.

use bytes::BytesMut;

use crate::protocol::{ProtocolError, ProxyProtocol};

const LENGTH_PREFIX: usize = 4;

/// Forwards complete `\n`-terminated lines.
#[derive(Debug, Clone)]
pub struct LineProtocol {
    chunk_size: usize,
    max_line: usize,
}

impl LineProtocol {
    pub fn new(chunk_size: usize, max_line: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            max_line: max_line.max(1),
        }
    }

    fn forward(&self, input: &[u8], out: &mut BytesMut) -> Result<usize, ProtocolError> {
        match input.iter().rposition(|&b| b == b'\n') {
            Some(last) => {
                let lines = &input[..=last];
                if let Some(size) = lines
                    .split_inclusive(|&b| b == b'\n')
                    .map(<[u8]>::len)
                    .find(|&len| len > self.max_line)
                {
                    return Err(ProtocolError::FrameTooLarge {
                        size,
                        max: self.max_line,
                    });
                }
                out.extend_from_slice(lines);
                Ok(lines.len())
            }
            None if input.len() > self.max_line => Err(ProtocolError::FrameTooLarge {
                size: input.len(),
                max: self.max_line,
            }),
            None => Ok(0),
        }
    }
}

impl ProxyProtocol for LineProtocol {
    fn on_client_readable(
        &mut self,
        input: &[u8],
        out: &mut BytesMut,
    ) -> Result<usize, ProtocolError> {
        self.forward(input, out)
    }

    fn on_server_readable(
        &mut self,
        input: &[u8],
        out: &mut BytesMut,
    ) -> Result<usize, ProtocolError> {
        self.forward(input, out)
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn max_pending(&self) -> usize {
        self.max_line + self.chunk_size
    }
}

/// Forwards complete frames of a 4-byte big-endian length followed by payload.
#[derive(Debug, Clone)]
pub struct LengthPrefixedProtocol {
    chunk_size: usize,
    max_frame: usize,
}

impl LengthPrefixedProtocol {
    pub fn new(chunk_size: usize, max_frame: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            max_frame,
        }
    }

    fn forward(&self, input: &[u8], out: &mut BytesMut) -> Result<usize, ProtocolError> {
        let mut offset = 0;
        while input.len() - offset >= LENGTH_PREFIX {
            let mut prefix = [0u8; LENGTH_PREFIX];
            prefix.copy_from_slice(&input[offset..offset + LENGTH_PREFIX]);
            let payload = u32::from_be_bytes(prefix) as usize;
            if payload > self.max_frame {
                return Err(ProtocolError::FrameTooLarge {
                    size: payload,
                    max: self.max_frame,
                });
            }
            let frame = LENGTH_PREFIX + payload;
            if input.len() - offset < frame {
                break;
            }
            out.extend_from_slice(&input[offset..offset + frame]);
            offset += frame;
        }
        Ok(offset)
    }
}

impl ProxyProtocol for LengthPrefixedProtocol {
    fn on_client_readable(
        &mut self,
        input: &[u8],
        out: &mut BytesMut,
    ) -> Result<usize, ProtocolError> {
        self.forward(input, out)
    }

    fn on_server_readable(
        &mut self,
        input: &[u8],
        out: &mut BytesMut,
    ) -> Result<usize, ProtocolError> {
        self.forward(input, out)
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn max_pending(&self) -> usize {
        LENGTH_PREFIX + self.max_frame + self.chunk_size
    }
}
