//! Persistence gateway.
//!
//! Narrow interfaces to the external store: contacts, the message log,
//! and the cached-session-key table. The SQL engine behind them is out of
//! scope; [`MemoryStore`] implements all three for tests and the dev
//! host. The replay set is deliberately not persisted — duplicate
//! suppression only needs to hold within a session lifetime.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::SystemTime;

use cardwire_core::crypto::SessionKey;
use cardwire_core::Fingerprint;
use dashmap::DashMap;
use uuid::Uuid;

/// A pinned peer.
#[derive(Debug, Clone)]
pub struct ContactRecord {
    /// The pin. Never changes for a contact.
    pub fingerprint: Fingerprint,
    /// User-editable name; seeded from the certificate CN.
    pub display_name: String,
    /// Static key pinned together with the certificate on first sight.
    pub static_public: Option<[u8; 32]>,
    /// The peer certificate, kept for session resumption.
    pub certificate_der: Option<Vec<u8>>,
    /// When the pin was created.
    pub pinned_at: SystemTime,
    /// Last endpoint this contact spoke from.
    pub last_seen_endpoint: Option<SocketAddr>,
    /// The UI acknowledged this pin.
    pub confirmed: bool,
}

/// Contact CRUD.
pub trait ContactStore: Send + Sync {
    /// Insert or update a contact. An existing contact keeps its
    /// user-edited display name.
    fn upsert(&self, contact: ContactRecord);

    /// Look up by fingerprint.
    fn get(&self, fingerprint: &Fingerprint) -> Option<ContactRecord>;

    /// Look up the contact that last spoke from an endpoint.
    fn find_by_endpoint(&self, endpoint: SocketAddr) -> Option<ContactRecord>;

    /// All pinned contacts.
    fn list(&self) -> Vec<ContactRecord>;

    /// Mark a pin as UI-confirmed. Returns `false` for unknown pins.
    fn confirm(&self, fingerprint: &Fingerprint) -> bool;

    /// Record the endpoint a contact was last seen at.
    fn touch_endpoint(&self, fingerprint: &Fingerprint, endpoint: SocketAddr);
}

/// Direction of a logged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Received from the peer.
    Inbound,
    /// Sent by the local user.
    Outbound,
}

/// One row of the message log.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    /// CID of the session the message travelled on.
    pub session_cid: u32,
    /// Inbound or outbound.
    pub direction: Direction,
    /// Application message UUID.
    pub uuid: Uuid,
    /// Message text.
    pub text: String,
    /// When the row was written.
    pub timestamp: SystemTime,
    /// Outbound: the peer's ACK arrived. Inbound: always true.
    pub delivered: bool,
}

/// Message log CRUD.
pub trait MessageStore: Send + Sync {
    /// Append a row.
    fn append(&self, record: MessageRecord);

    /// Flip the delivered flag once the ACK is verified.
    fn mark_delivered(&self, uuid: &Uuid);

    /// The most recent `limit` rows exchanged with a peer, oldest first.
    fn history(&self, peer: &Fingerprint, limit: usize) -> Vec<MessageRecord>;
}

/// Cached session keys, for resumption across suspends and restarts.
pub trait SessionCache: Send + Sync {
    /// Remember the session key for a peer.
    fn save(&self, fingerprint: &Fingerprint, cid: u32, key: &SessionKey, updated_at: SystemTime);

    /// Recall a peer's cached session, if any.
    fn load(&self, fingerprint: &Fingerprint) -> Option<(u32, SessionKey)>;

    /// Drop a peer's cached session.
    fn forget(&self, fingerprint: &Fingerprint);
}

struct CachedSession {
    cid: u32,
    key_hex: String,
    #[allow(dead_code)]
    updated_at: SystemTime,
}

/// In-memory persistence gateway.
///
/// Backs the test suite and the dev host. Maps are concurrent because the
/// gateway is shared between the node loop and the embedding host.
#[derive(Default)]
pub struct MemoryStore {
    contacts: DashMap<[u8; 32], ContactRecord>,
    log: Mutex<Vec<MessageRecord>>,
    cache: DashMap<[u8; 32], CachedSession>,
    /// CID → peer binding, fed by cache saves; outlives `forget` so the
    /// message history stays queryable for closed sessions.
    session_peers: DashMap<u32, Fingerprint>,
}

impl MemoryStore {
    /// Fresh, empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContactStore for MemoryStore {
    fn upsert(&self, contact: ContactRecord) {
        let key = *contact.fingerprint.as_bytes();
        match self.contacts.get_mut(&key) {
            Some(mut existing) => {
                // The display name is user-owned after first sight.
                existing.static_public = existing.static_public.or(contact.static_public);
                if contact.certificate_der.is_some() {
                    existing.certificate_der = contact.certificate_der;
                }
                if contact.last_seen_endpoint.is_some() {
                    existing.last_seen_endpoint = contact.last_seen_endpoint;
                }
            }
            None => {
                self.contacts.insert(key, contact);
            }
        }
    }

    fn get(&self, fingerprint: &Fingerprint) -> Option<ContactRecord> {
        self.contacts
            .get(fingerprint.as_bytes())
            .map(|c| c.value().clone())
    }

    fn find_by_endpoint(&self, endpoint: SocketAddr) -> Option<ContactRecord> {
        self.contacts
            .iter()
            .find(|c| c.last_seen_endpoint == Some(endpoint))
            .map(|c| c.value().clone())
    }

    fn list(&self) -> Vec<ContactRecord> {
        self.contacts.iter().map(|c| c.value().clone()).collect()
    }

    fn confirm(&self, fingerprint: &Fingerprint) -> bool {
        match self.contacts.get_mut(fingerprint.as_bytes()) {
            Some(mut c) => {
                c.confirmed = true;
                true
            }
            None => false,
        }
    }

    fn touch_endpoint(&self, fingerprint: &Fingerprint, endpoint: SocketAddr) {
        if let Some(mut c) = self.contacts.get_mut(fingerprint.as_bytes()) {
            c.last_seen_endpoint = Some(endpoint);
        }
    }
}

impl MessageStore for MemoryStore {
    fn append(&self, record: MessageRecord) {
        if let Ok(mut log) = self.log.lock() {
            log.push(record);
        }
    }

    fn mark_delivered(&self, uuid: &Uuid) {
        if let Ok(mut log) = self.log.lock() {
            for record in log.iter_mut() {
                if record.uuid == *uuid {
                    record.delivered = true;
                }
            }
        }
    }

    fn history(&self, peer: &Fingerprint, limit: usize) -> Vec<MessageRecord> {
        let cids: Vec<u32> = self
            .session_peers
            .iter()
            .filter(|e| e.value() == peer)
            .map(|e| *e.key())
            .collect();

        let Ok(log) = self.log.lock() else {
            return Vec::new();
        };
        let mut rows: Vec<MessageRecord> = log
            .iter()
            .filter(|r| cids.contains(&r.session_cid))
            .cloned()
            .collect();
        if rows.len() > limit {
            rows.drain(..rows.len() - limit);
        }
        rows
    }
}

impl SessionCache for MemoryStore {
    fn save(&self, fingerprint: &Fingerprint, cid: u32, key: &SessionKey, updated_at: SystemTime) {
        self.session_peers.insert(cid, *fingerprint);
        self.cache.insert(
            *fingerprint.as_bytes(),
            CachedSession {
                cid,
                key_hex: hex::encode(key.as_bytes()),
                updated_at,
            },
        );
    }

    fn load(&self, fingerprint: &Fingerprint) -> Option<(u32, SessionKey)> {
        let cached = self.cache.get(fingerprint.as_bytes())?;
        let bytes = hex::decode(&cached.key_hex).ok()?;
        let key: [u8; 32] = bytes.try_into().ok()?;
        Some((cached.cid, SessionKey::from_bytes(key)))
    }

    fn forget(&self, fingerprint: &Fingerprint) {
        self.cache.remove(fingerprint.as_bytes());
    }
}
