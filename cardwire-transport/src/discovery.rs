//! Discovery-layer interface types.
//!
//! Service advertisement and browsing live outside the core; the node
//! only consumes hints and produces an advertisement. Nothing here is
//! trusted — all security comes from the handshake and TOFU pinning.

use std::net::{IpAddr, SocketAddr};

/// A peer sighting reported by the discovery service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHint {
    /// Unverified human-readable label from the advertisement.
    pub display_hint: String,
    /// Reported address.
    pub ip: IpAddr,
    /// Reported port.
    pub port: u16,
}

impl PeerHint {
    /// The endpoint this hint points at.
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// What the local node asks the discovery service to announce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Port the node is listening on.
    pub own_port: u16,
    /// Label to advertise.
    pub own_hint: String,
}
