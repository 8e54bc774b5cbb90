//! Error taxonomy shared by the accept path and the reactor.
//!
//! Every variant here is contained at connection scope: the reactor resolves
//! it to a state transition and a log line, never to a process failure.

use std::io;

use thiserror::Error;

use crate::load_balancer::Endpoint;
use crate::protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Pool exhausted at selection time.
    #[error("no healthy backend available")]
    NoHealthyBackend,

    /// Non-blocking connect errored or did not finish in time.
    #[error("connect to backend {endpoint} failed: {source}")]
    BackendConnectFailed {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    /// Reset, broken pipe or any other hard socket error.
    #[error("peer reset the connection: {0}")]
    PeerReset(#[source] io::Error),

    /// Orderly close observed where data was still expected.
    #[error("peer closed the connection")]
    PeerClosed,

    /// The framing policy rejected the byte stream.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ProxyError {
    /// Classify an I/O error observed on an established socket.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::WriteZero => ProxyError::PeerClosed,
            _ => ProxyError::PeerReset(err),
        }
    }

    /// Short label used as a metrics dimension.
    pub fn reason(&self) -> &'static str {
        match self {
            ProxyError::NoHealthyBackend => "no_healthy_backend",
            ProxyError::BackendConnectFailed { .. } => "backend_connect_failed",
            ProxyError::PeerReset(_) => "peer_reset",
            ProxyError::PeerClosed => "peer_closed",
            ProxyError::Protocol(_) => "protocol",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_classify() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(matches!(ProxyError::from_io(reset), ProxyError::PeerReset(_)));

        let eof = io::Error::from(io::ErrorKind::WriteZero);
        assert!(matches!(ProxyError::from_io(eof), ProxyError::PeerClosed));
    }

    #[test]
    fn reasons_are_stable() {
        assert_eq!(ProxyError::NoHealthyBackend.reason(), "no_healthy_backend");
        assert_eq!(ProxyError::PeerClosed.reason(), "peer_closed");
    }
}
