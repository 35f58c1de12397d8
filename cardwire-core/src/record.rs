//! Encrypted record layer.
//!
//! After a session is Established, application traffic flows as
//! `nonce[12] || aead_seal(session_key, nonce, plaintext, aad=[])`.
//! Nonces come from the CSPRNG; receivers suppress replays with a bounded
//! set of recently seen nonces rather than relying on any ordering. The
//! window holds the most recent 4096 entries; a nonce older than that
//! would be accepted again, which the 96-bit random-nonce birthday bound
//! makes irrelevant at realistic message volumes.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

use zeroize::Zeroizing;

use crate::crypto::{aead_open, aead_seal, random_nonce, SessionKey};
use crate::error::ProtocolError;
use crate::packet::{RecordPayload, NONCE_LEN};

/// Replay window capacity, in nonces.
pub const REPLAY_WINDOW: usize = 4096;

/// Bounded insertion-ordered set.
///
/// Once full, inserting a new element evicts the oldest. Used for the
/// nonce replay window and for the delivered-UUID set.
#[derive(Debug, Clone)]
pub struct BoundedSet<T> {
    seen: HashSet<T>,
    order: VecDeque<T>,
    capacity: usize,
}

impl<T: Eq + Hash + Clone> BoundedSet<T> {
    /// Create a set holding at most `capacity` elements.
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity.min(1024)),
            order: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Membership test.
    pub fn contains(&self, value: &T) -> bool {
        self.seen.contains(value)
    }

    /// Insert a value. Returns `false` if it was already present.
    pub fn insert(&mut self, value: T) -> bool {
        if !self.seen.insert(value.clone()) {
            return false;
        }
        self.order.push_back(value);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True if nothing has been inserted.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Outcome of opening a record.
#[derive(Debug)]
pub enum Opened {
    /// First sight of this nonce; plaintext is handed over.
    Fresh(Zeroizing<Vec<u8>>),
    /// Authentic but already seen; drop without further processing.
    Replay,
}

/// Seal a plaintext into a record payload (`nonce || ciphertext`).
pub fn seal(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let nonce = random_nonce();
    let ciphertext = aead_seal(key.as_bytes(), &nonce, plaintext, b"")?;
    let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);
    Ok(payload)
}

/// Open a record payload and update the replay window.
///
/// Decryption runs first; the window is only consulted and updated for
/// authentic records, so forged nonces cannot poison it.
///
/// # Errors
///
/// `MalformedPacket` if the payload cannot hold a nonce and tag;
/// `AuthFailure` if the ciphertext does not authenticate.
pub fn open(
    key: &SessionKey,
    payload: &[u8],
    window: &mut BoundedSet<[u8; NONCE_LEN]>,
) -> Result<Opened, ProtocolError> {
    let record = RecordPayload::parse(payload)?;
    let plaintext = aead_open(key.as_bytes(), &record.nonce, record.ciphertext, b"")?;
    if !window.insert(record.nonce) {
        return Ok(Opened::Replay);
    }
    Ok(Opened::Fresh(plaintext))
}
