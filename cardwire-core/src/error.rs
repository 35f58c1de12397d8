//! Protocol errors.
//!
//! Errors raised on the datagram path are dropped silently by the caller
//! (see the demultiplexer's silence policy); none of the messages below may
//! leak key material, plaintext, or certificate contents.

use std::fmt;

/// All possible protocol errors.
///
/// The datagram path treats `MalformedPacket`, `AuthFailure`,
/// `DuplicateMessage`, and `UnknownSession` as silent drops. `PinMismatch`
/// closes the session and is never retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Datagram too short, unknown type byte, or a length field overshoots.
    MalformedPacket,

    /// AEAD authentication failed on open.
    AuthFailure,

    /// Certificate does not verify against any configured trust root.
    UntrustedIssuer,

    /// Peer presented a certificate or static key that contradicts the pin.
    PinMismatch,

    /// A cryptographic primitive produced an unusable result.
    CryptoFailure,

    /// The card capability is not available.
    CardUnavailable,

    /// Application message UUID was already delivered.
    DuplicateMessage,

    /// No session is known for the packet's CID.
    UnknownSession,

    /// Operation is invalid in the session's current state.
    InvalidState,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Deliberately terse. Do not leak details.
        match self {
            Self::MalformedPacket => write!(f, "malformed packet"),
            Self::AuthFailure => write!(f, "authentication failure"),
            Self::UntrustedIssuer => write!(f, "untrusted issuer"),
            Self::PinMismatch => write!(f, "pin mismatch"),
            Self::CryptoFailure => write!(f, "crypto failure"),
            Self::CardUnavailable => write!(f, "card unavailable"),
            Self::DuplicateMessage => write!(f, "duplicate message"),
            Self::UnknownSession => write!(f, "unknown session"),
            Self::InvalidState => write!(f, "invalid state"),
        }
    }
}

impl std::error::Error for ProtocolError {}
