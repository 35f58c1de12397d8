//! Events surfaced to the embedding UI.
//!
//! The node never calls into the UI; it pushes these over an unbounded
//! channel and the host renders them however it likes.

use std::net::SocketAddr;

use cardwire_core::Fingerprint;
use uuid::Uuid;

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicit user action.
    UserAction,
    /// Peer contradicted its pin; never retried automatically.
    PinMismatch,
    /// Decryption failures crossed the per-session threshold.
    AuthFailure,
    /// Handshake retransmissions exhausted.
    HandshakeTimeout,
    /// A newer session to the same peer took over.
    Superseded,
    /// Node shutdown.
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserAction => write!(f, "closed by user"),
            Self::PinMismatch => write!(f, "pin mismatch"),
            Self::AuthFailure => write!(f, "authentication failures"),
            Self::HandshakeTimeout => write!(f, "handshake timeout"),
            Self::Superseded => write!(f, "superseded"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// UI-visible happenings.
#[derive(Debug, Clone)]
pub enum UiEvent {
    /// A previously unknown peer completed a handshake and was pinned.
    /// The session stays unconfirmed until `confirm_peer` is called.
    NewPeer {
        /// Pinned fingerprint.
        fingerprint: Fingerprint,
        /// Name from the peer's certificate.
        display_name: String,
        /// Where the peer spoke from.
        endpoint: SocketAddr,
    },

    /// The UI confirmed a pinned peer.
    PeerConfirmed {
        /// The confirmed fingerprint.
        fingerprint: Fingerprint,
    },

    /// An endpoint presented a certificate outside the trust roots.
    /// Emitted at most once per endpoint.
    UntrustedPeer {
        /// The offending endpoint.
        endpoint: SocketAddr,
    },

    /// An endpoint contradicted its pinned fingerprint or static key.
    PinMismatch {
        /// The offending endpoint.
        endpoint: SocketAddr,
        /// What was pinned.
        pinned: Fingerprint,
        /// What the endpoint presented.
        presented: Fingerprint,
    },

    /// A session reached Established.
    SessionEstablished {
        /// Session CID.
        cid: u32,
        /// Peer fingerprint.
        fingerprint: Fingerprint,
        /// True when this was a resume of a cached session.
        resumed: bool,
    },

    /// A session reached Closed.
    SessionClosed {
        /// Session CID.
        cid: u32,
        /// Why it closed.
        reason: CloseReason,
    },

    /// An application message was decrypted and persisted.
    MessageReceived {
        /// Session CID.
        cid: u32,
        /// Sender fingerprint.
        from: Fingerprint,
        /// Message UUID; absent for peers that sent bare text.
        uuid: Option<Uuid>,
        /// Message text.
        text: String,
    },

    /// The peer acknowledged a message.
    MessageDelivered {
        /// UUID of the delivered message.
        uuid: Uuid,
    },

    /// A message could not be delivered.
    MessageFailed {
        /// UUID of the failed message.
        uuid: Uuid,
        /// Human-readable reason.
        reason: String,
    },

    /// The peer announced the start of a drained-queue burst.
    PendingBatchStarted {
        /// Session CID.
        cid: u32,
    },

    /// The peer finished its drained-queue burst.
    PendingBatchFinished {
        /// Session CID.
        cid: u32,
    },
}
