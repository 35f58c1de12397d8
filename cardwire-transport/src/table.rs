//! Session table and CID allocation.
//!
//! One map from CID to Session, owned exclusively by the node event loop.
//! CIDs are random 32-bit values; a freed CID enters a cool-down ring of
//! the most recent 1024 retirements so late packets for a dead session
//! cannot land on a fresh one.

use std::collections::{HashMap, HashSet, VecDeque};

use cardwire_core::{Fingerprint, Role, Session, SessionState};

/// Retired CIDs kept out of circulation.
pub const CID_COOLDOWN: usize = 1024;

/// CID → Session map with allocation and retirement.
pub struct SessionTable {
    sessions: HashMap<u32, Session>,
    retired: VecDeque<u32>,
    retired_set: HashSet<u32>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            retired: VecDeque::with_capacity(CID_COOLDOWN),
            retired_set: HashSet::with_capacity(CID_COOLDOWN),
        }
    }

    /// Draw a random CID not currently live and not in cool-down.
    pub fn allocate_cid(&self) -> u32 {
        loop {
            let cid = rand::random::<u32>();
            if !self.sessions.contains_key(&cid) && !self.retired_set.contains(&cid) {
                return cid;
            }
        }
    }

    /// Insert a session under its CID.
    pub fn insert(&mut self, session: Session) {
        self.sessions.insert(session.cid(), session);
    }

    /// Borrow a session.
    pub fn get(&self, cid: u32) -> Option<&Session> {
        self.sessions.get(&cid)
    }

    /// Mutably borrow a session.
    pub fn get_mut(&mut self, cid: u32) -> Option<&mut Session> {
        self.sessions.get_mut(&cid)
    }

    /// Remove a session and retire its CID into cool-down.
    pub fn remove(&mut self, cid: u32) -> Option<Session> {
        let session = self.sessions.remove(&cid)?;
        if self.retired_set.insert(cid) {
            self.retired.push_back(cid);
            if self.retired.len() > CID_COOLDOWN {
                if let Some(oldest) = self.retired.pop_front() {
                    self.retired_set.remove(&oldest);
                }
            }
        }
        Some(session)
    }

    /// CIDs of live sessions, for timer scans.
    pub fn cids(&self) -> Vec<u32> {
        self.sessions.keys().copied().collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Find the non-Closed session bound to a peer, preferring Established
    /// or Suspended over Handshaking.
    pub fn find_by_fingerprint(&self, peer: &Fingerprint) -> Option<u32> {
        let mut handshaking = None;
        for (cid, session) in &self.sessions {
            match session.state() {
                SessionState::Established | SessionState::Suspended => {
                    if session.peer_identity().map(|i| i.fingerprint) == Some(*peer) {
                        return Some(*cid);
                    }
                }
                SessionState::Handshaking => {
                    if session.peer_identity().map(|i| i.fingerprint) == Some(*peer) {
                        handshaking = Some(*cid);
                    }
                }
                SessionState::Closed => {}
            }
        }
        handshaking
    }

    /// CIDs of other sessions holding the same `(fingerprint, role)` pair.
    /// The newest session supersedes these.
    pub fn superseded_by(&self, peer: &Fingerprint, role: Role, keep_cid: u32) -> Vec<u32> {
        self.sessions
            .iter()
            .filter(|(cid, session)| {
                **cid != keep_cid
                    && session.role() == role
                    && session.state() != SessionState::Closed
                    && session.peer_identity().map(|i| i.fingerprint) == Some(*peer)
            })
            .map(|(cid, _)| *cid)
            .collect()
    }
}
