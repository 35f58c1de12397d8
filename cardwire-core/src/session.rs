//! Session data model and state machine.
//!
//! States: Handshaking → Established → Suspended → Closed.
//!
//! A session is created by the handshake engine on a fresh CID, becomes
//! Established once a key is derived and the peer identity verified,
//! Suspended after prolonged idleness when a resume is plausible, and
//! Closed on user action, pin mismatch, or repeated decryption failure.
//! Closed is final.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::crypto::SessionKey;
use crate::error::ProtocolError;
use crate::handshake::Initiator;
use crate::identity::Identity;
use crate::packet::{Packet, NONCE_LEN, PUBKEY_LEN};
use crate::record::{self, BoundedSet, Opened, REPLAY_WINDOW};

/// Delivered-UUID window capacity.
pub const UUID_WINDOW: usize = 4096;

/// Decryption failures tolerated within [`DECRYPT_FAILURE_PERIOD`] before
/// the session is closed.
pub const DECRYPT_FAILURE_LIMIT: usize = 5;

/// Sliding window for the decryption-failure threshold.
pub const DECRYPT_FAILURE_PERIOD: Duration = Duration::from_secs(60);

/// Which side of the handshake this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Dialed the peer; sent HANDSHAKE_INIT or RECONNECT_REQ.
    Initiator,
    /// Answered the peer.
    Responder,
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Key not yet derived; handshake in flight.
    Handshaking,
    /// Key derived, identity verified, traffic flows.
    Established,
    /// Idle or transport lost; key cached, resume plausible.
    Suspended,
    /// Final state. CID goes to cool-down.
    Closed,
}

/// An application message awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    /// v4 UUID assigned at send time.
    pub uuid: Uuid,
    /// Message text.
    pub text: String,
    /// Transmission attempts so far.
    pub attempts: u32,
    /// When the next retransmission is due.
    pub next_retry: Instant,
}

/// One peer relationship over one CID.
pub struct Session {
    cid: u32,
    role: Role,
    state: SessionState,

    /// Where the peer was last heard from.
    pub peer_endpoint: SocketAddr,

    peer_identity: Option<Identity>,
    peer_static: Option<[u8; PUBKEY_LEN]>,
    session_key: Option<SessionKey>,

    seen_nonces: BoundedSet<[u8; NONCE_LEN]>,
    /// Application-level duplicate suppression.
    pub seen_uuids: BoundedSet<Uuid>,
    /// Messages not yet acknowledged, in send order.
    pub pending_outbound: VecDeque<PendingMessage>,

    /// Pinned via TOFU this handshake; awaiting UI confirmation.
    pub unconfirmed: bool,

    /// Initiator handshake state, held until the RESP arrives.
    pub initiator_hs: Option<Initiator>,
    /// Responder's cached RESP, re-emitted verbatim for INIT retransmits.
    pub cached_resp: Option<Packet>,
    /// Handshake retransmissions performed.
    pub hs_attempts: u32,
    /// When the current handshake attempt times out.
    pub hs_deadline: Option<Instant>,
    /// When an outstanding RECONNECT_REQ gives up.
    pub resume_deadline: Option<Instant>,
    /// The pending queue was already drained in this resume cycle.
    pub drained_since_resume: bool,

    decrypt_failures: VecDeque<Instant>,

    /// When this session was created.
    pub created_at: Instant,
    last_activity: Instant,
}

impl Session {
    fn base(cid: u32, role: Role, state: SessionState, peer_endpoint: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            cid,
            role,
            state,
            peer_endpoint,
            peer_identity: None,
            peer_static: None,
            session_key: None,
            seen_nonces: BoundedSet::new(REPLAY_WINDOW),
            seen_uuids: BoundedSet::new(UUID_WINDOW),
            pending_outbound: VecDeque::new(),
            unconfirmed: false,
            initiator_hs: None,
            cached_resp: None,
            hs_attempts: 0,
            hs_deadline: None,
            resume_deadline: None,
            drained_since_resume: false,
            decrypt_failures: VecDeque::new(),
            created_at: now,
            last_activity: now,
        }
    }

    /// New dial-side session with its handshake state attached.
    pub fn new_initiator(cid: u32, peer_endpoint: SocketAddr, hs: Initiator) -> Self {
        let mut session = Self::base(cid, Role::Initiator, SessionState::Handshaking, peer_endpoint);
        session.initiator_hs = Some(hs);
        session
    }

    /// New answer-side session, Established immediately by `establish`.
    pub fn new_responder(cid: u32, peer_endpoint: SocketAddr) -> Self {
        Self::base(cid, Role::Responder, SessionState::Handshaking, peer_endpoint)
    }

    /// Rebuild a session from a cached key for resumption.
    ///
    /// Starts Suspended; a RECONNECT exchange or a first successful
    /// decrypt promotes it.
    pub fn new_resuming(
        cid: u32,
        peer_endpoint: SocketAddr,
        role: Role,
        identity: Identity,
        key: SessionKey,
    ) -> Self {
        let mut session = Self::base(cid, role, SessionState::Suspended, peer_endpoint);
        session.peer_identity = Some(identity);
        session.session_key = Some(key);
        session
    }

    /// Connection identifier.
    pub fn cid(&self) -> u32 {
        self.cid
    }

    /// Handshake role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Verified peer identity; present from Established onward.
    pub fn peer_identity(&self) -> Option<&Identity> {
        self.peer_identity.as_ref()
    }

    /// Peer's pinned static key, when learned via handshake.
    pub fn peer_static(&self) -> Option<&[u8; PUBKEY_LEN]> {
        self.peer_static.as_ref()
    }

    /// Session key, for persistence on suspend.
    pub fn session_key(&self) -> Option<&SessionKey> {
        self.session_key.as_ref()
    }

    /// Attach identity and key; Handshaking → Established.
    pub fn establish(
        &mut self,
        identity: Identity,
        peer_static: [u8; PUBKEY_LEN],
        key: SessionKey,
    ) -> Result<(), ProtocolError> {
        if self.state != SessionState::Handshaking {
            return Err(ProtocolError::InvalidState);
        }
        self.peer_identity = Some(identity);
        self.peer_static = Some(peer_static);
        self.session_key = Some(key);
        self.state = SessionState::Established;
        self.initiator_hs = None;
        self.hs_deadline = None;
        self.note_activity();
        Ok(())
    }

    /// Established → Suspended. Pending messages are retained.
    pub fn suspend(&mut self) -> Result<(), ProtocolError> {
        if self.state != SessionState::Established {
            return Err(ProtocolError::InvalidState);
        }
        self.state = SessionState::Suspended;
        self.drained_since_resume = false;
        Ok(())
    }

    /// Suspended → Established, after a RECONNECT exchange or an implicit
    /// resume via a first successful decrypt.
    pub fn promote(&mut self) -> Result<(), ProtocolError> {
        if self.state != SessionState::Suspended {
            return Err(ProtocolError::InvalidState);
        }
        self.state = SessionState::Established;
        self.resume_deadline = None;
        self.note_activity();
        Ok(())
    }

    /// Any state → Closed. Final. Returns the messages that were pending
    /// so the caller can surface them as failed.
    pub fn close(&mut self) -> Vec<PendingMessage> {
        self.state = SessionState::Closed;
        self.session_key = None;
        self.initiator_hs = None;
        self.cached_resp = None;
        self.hs_deadline = None;
        self.resume_deadline = None;
        self.pending_outbound.drain(..).collect()
    }

    /// Mark traffic on this session.
    pub fn note_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    /// How long the session has been quiet.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Seal an application payload under the session key.
    pub fn seal_record(&self, plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let key = self
            .session_key
            .as_ref()
            .ok_or(ProtocolError::InvalidState)?;
        record::seal(key, plaintext)
    }

    /// Open an inbound record payload.
    ///
    /// A successful decrypt on a Suspended session is an implicit resume
    /// and promotes it to Established.
    pub fn open_record(&mut self, payload: &[u8]) -> Result<Opened, ProtocolError> {
        if !matches!(
            self.state,
            SessionState::Established | SessionState::Suspended
        ) {
            return Err(ProtocolError::InvalidState);
        }
        let key = self
            .session_key
            .as_ref()
            .ok_or(ProtocolError::InvalidState)?;
        let opened = record::open(key, payload, &mut self.seen_nonces)?;
        if self.state == SessionState::Suspended {
            self.state = SessionState::Established;
            self.resume_deadline = None;
        }
        self.note_activity();
        Ok(opened)
    }

    /// Count a decryption failure.
    ///
    /// Returns `true` once the threshold (5 within 60 s) is crossed and
    /// the session must be closed.
    pub fn note_decrypt_failure(&mut self) -> bool {
        let now = Instant::now();
        self.decrypt_failures.push_back(now);
        while let Some(front) = self.decrypt_failures.front() {
            if now.duration_since(*front) > DECRYPT_FAILURE_PERIOD {
                self.decrypt_failures.pop_front();
            } else {
                break;
            }
        }
        self.decrypt_failures.len() >= DECRYPT_FAILURE_LIMIT
    }
}
