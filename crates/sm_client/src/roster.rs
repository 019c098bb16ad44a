//! Room membership as last reported by the relay.
//!
//! Each entry owns a fresh X25519 key pair for the pairwise handshake. An
//! entry is *established* once it has a shared key, and *visible* once the
//! peer's username has also arrived.

use std::collections::HashMap;

use sm_crypto::{EphemeralKeyPair, SymmetricKey};

use crate::events::PeerSummary;

#[derive(Debug)]
pub struct PeerEntry {
    keys: EphemeralKeyPair,
    shared: Option<SymmetricKey>,
    username: Option<String>,
}

impl PeerEntry {
    fn new() -> Self {
        Self {
            keys: EphemeralKeyPair::generate(),
            shared: None,
            username: None,
        }
    }

    pub fn keys(&self) -> &EphemeralKeyPair {
        &self.keys
    }

    pub fn public_hex(&self) -> String {
        self.keys.public_hex()
    }

    pub fn shared(&self) -> Option<&SymmetricKey> {
        self.shared.as_ref()
    }

    /// Install the pairwise key. Returns `false` (and keeps the existing
    /// key) if one is already set.
    pub fn establish(&mut self, key: SymmetricKey) -> bool {
        if self.shared.is_some() {
            return false;
        }
        self.shared = Some(key);
        true
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Returns `true` when the name actually changed.
    pub fn set_username(&mut self, name: String) -> bool {
        if self.username.as_deref() == Some(name.as_str()) {
            return false;
        }
        self.username = Some(name);
        true
    }

    pub fn is_visible(&self) -> bool {
        self.shared.is_some() && self.username.is_some()
    }
}

#[derive(Debug, Default)]
pub struct Roster {
    peers: HashMap<String, PeerEntry>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerEntry> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerEntry> {
        self.peers.get_mut(peer_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PeerEntry)> {
        self.peers.iter()
    }

    /// Entry for `peer_id`, created with a fresh key pair if absent. The
    /// flag is `true` when the entry was created by this call.
    pub fn entry(&mut self, peer_id: &str) -> (&mut PeerEntry, bool) {
        let created = !self.peers.contains_key(peer_id);
        let entry = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(PeerEntry::new);
        (entry, created)
    }

    /// Drop every peer not in `present`. Returns the removed ids.
    pub fn retain_only(&mut self, present: &[String]) -> Vec<String> {
        let mut removed = Vec::new();
        self.peers.retain(|id, _| {
            let keep = present.iter().any(|p| p == id);
            if !keep {
                removed.push(id.clone());
            }
            keep
        });
        removed.sort();
        removed
    }

    /// Ids of peers with a pairwise key, sorted.
    pub fn established(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, e)| e.shared.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Peers with both a pairwise key and a username, sorted by id.
    pub fn visible(&self) -> Vec<PeerSummary> {
        let mut out: Vec<PeerSummary> = self
            .peers
            .iter()
            .filter_map(|(id, e)| match (&e.shared, &e.username) {
                (Some(_), Some(name)) => Some(PeerSummary {
                    peer_id: id.clone(),
                    username: name.clone(),
                }),
                _ => None,
            })
            .collect();
        out.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        out
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
