//! Transport errors.

use std::fmt;

use cardwire_core::ProtocolError;

/// Errors surfaced by the transport layer.
///
/// Datagram-path protocol errors never appear here; those are dropped
/// silently inside the demultiplexer and only counted. This type covers
/// the embedding host's interactions: binding, configuration of the node,
/// and command submission.
#[derive(Debug)]
pub enum TransportError {
    /// Failed to bind the UDP socket.
    Bind(String),
    /// Protocol-level error from cardwire-core.
    Protocol(ProtocolError),
    /// The node event loop is gone; commands cannot be delivered.
    NodeStopped,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind(msg) => write!(f, "socket bind failed: {}", msg),
            Self::Protocol(e) => write!(f, "protocol error: {}", e),
            Self::NodeStopped => write!(f, "node stopped"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<ProtocolError> for TransportError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}
