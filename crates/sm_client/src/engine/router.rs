//! Relay message dispatch, pairwise handshake and outbound peer traffic.

use std::collections::BTreeMap;

use serde_json::Value;
use sm_crypto::{kdf, KdfMode, SymmetricKey};
use sm_proto::{peer::normalize_username, ChannelData, PeerMessage, RelayMessage, MAX_RELAY_ENVELOPE_LEN};
use tracing::{debug, info, warn};

use super::{ConnectionState, Engine};
use crate::{
    error::SendError,
    events::{ChannelMessage, ClientEvent},
};

impl Engine {
    pub(super) fn route(&mut self, msg: RelayMessage) {
        match msg {
            RelayMessage::Roster { peers } => self.on_roster(peers),
            RelayMessage::Direct { payload, peer_id } => self.on_direct(&peer_id, &payload),
            other => debug!(op = "route", action = other.action(), "ignoring relay-bound action"),
        }
    }

    /// Reconcile the roster with a relay snapshot and offer our key to every
    /// newcomer in a single batch.
    fn on_roster(&mut self, peers: Vec<String>) {
        let removed = self.roster.retain_only(&peers);
        for id in &removed {
            debug!(op = "roster", peer = %id, "peer left");
        }

        let mut offers = BTreeMap::new();
        for id in peers.iter().filter(|id| !id.is_empty()) {
            let (entry, created) = self.roster.entry(id);
            if created {
                offers.insert(id.clone(), entry.public_hex());
            }
        }
        debug!(
            op = "roster",
            members = peers.len(),
            joined = offers.len(),
            left = removed.len(),
            "roster snapshot"
        );
        if !offers.is_empty() {
            self.send_relay(&RelayMessage::Batch { payloads: offers });
        }
        let peers = self.roster.visible();
        self.emit(ClientEvent::PeerList { peers });
    }

    fn on_direct(&mut self, peer_id: &str, payload: &str) {
        let key = self.roster.get(peer_id).and_then(|e| e.shared()).cloned();
        match key {
            Some(key) => self.on_peer_payload(peer_id, payload, &key),
            None => self.complete_handshake(peer_id, payload),
        }
    }

    /// `peer_public` is the peer's hex X25519 key. An unknown sender gets
    /// our key back first so it can complete its side.
    fn complete_handshake(&mut self, peer_id: &str, peer_public: &str) {
        let Some(creds) = self.credentials.as_ref() else {
            return;
        };
        let password_hash = creds.password_hash_bytes();
        let room_hash = creds.room_hash_bytes();
        let username = creds.username().to_string();
        let mode = self.config.kdf_mode();
        if mode == KdfMode::LegacyXor && !self.legacy_warned {
            warn!(op = "handshake", "deriving pairwise keys with the legacy XOR scheme");
            self.legacy_warned = true;
        }

        let (created, own_public, derived) = {
            let (entry, created) = self.roster.entry(peer_id);
            let derived = entry
                .keys()
                .diffie_hellman_hex(peer_public)
                .and_then(|secret| kdf::derive_peer_key(&secret[..], &password_hash, &room_hash, mode));
            (created, entry.public_hex(), derived)
        };

        if created {
            debug!(op = "handshake", peer = %peer_id, "unsolicited key; replying with ours");
            self.send_relay(&RelayMessage::Direct {
                payload: own_public,
                peer_id: peer_id.to_string(),
            });
        }

        let key = match derived {
            Ok(key) => key,
            Err(err) => {
                warn!(op = "handshake", peer = %peer_id, error = %err, "pairwise key derivation failed");
                return;
            }
        };
        let sealed = match self.codec.seal(&PeerMessage::Username { name: username }, &key) {
            Ok(sealed) => sealed,
            Err(err) => {
                warn!(op = "handshake", peer = %peer_id, error = %err, "could not seal username");
                return;
            }
        };
        if let Some(entry) = self.roster.get_mut(peer_id) {
            entry.establish(key);
        }
        info!(op = "handshake", peer = %peer_id, "pairwise key established");
        self.send_relay(&RelayMessage::Direct {
            payload: sealed,
            peer_id: peer_id.to_string(),
        });
    }

    fn on_peer_payload(&mut self, peer_id: &str, payload: &str, key: &SymmetricKey) {
        let value: Value = match self.codec.open(payload, key) {
            Ok(value) => value,
            Err(err) => {
                debug!(op = "peer_open", peer = %peer_id, error = %err, "dropping undecryptable peer payload");
                return;
            }
        };
        let msg = match PeerMessage::from_value(value) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(op = "peer_open", peer = %peer_id, error = %err, "dropping invalid peer message");
                return;
            }
        };

        match msg {
            PeerMessage::Username { name } => {
                let Some(name) = normalize_username(&name) else {
                    return;
                };
                let Some(entry) = self.roster.get_mut(peer_id) else {
                    return;
                };
                if entry.set_username(name.clone()) {
                    debug!(op = "peer", peer = %peer_id, "peer username set");
                    self.emit(ClientEvent::PeerSecured {
                        peer_id: peer_id.to_string(),
                        username: name,
                    });
                }
            }
            PeerMessage::Channel { kind, data } => {
                let Some(username) = self
                    .roster
                    .get(peer_id)
                    .and_then(|e| e.username())
                    .map(str::to_string)
                else {
                    debug!(op = "peer", peer = %peer_id, "dropping message from peer without username");
                    return;
                };
                self.emit(ClientEvent::Message(ChannelMessage {
                    peer_id: peer_id.to_string(),
                    username,
                    kind,
                    data,
                }));
            }
        }
    }

    /// Seal `data` once per visible peer and hand the relay one batch.
    /// Returns the number of recipients; `0` means nothing was sent.
    pub fn send_channel_message(
        &mut self,
        kind: &str,
        data: impl Into<ChannelData>,
    ) -> Result<usize, SendError> {
        if kind.is_empty() {
            return Err(SendError::EmptyType);
        }
        if self.state != ConnectionState::Secured {
            return Err(SendError::NotSecured);
        }
        let relay_key = self.relay_key().cloned().ok_or(SendError::NotSecured)?;

        let message = PeerMessage::Channel {
            kind: kind.to_string(),
            data: data.into(),
        };
        let mut payloads = BTreeMap::new();
        for (id, entry) in self.roster.iter().filter(|(_, e)| e.is_visible()) {
            let Some(key) = entry.shared() else {
                continue;
            };
            payloads.insert(id.clone(), self.codec.seal(&message, key)?);
        }
        if payloads.is_empty() {
            debug!(op = "send", kind, "no established peers; nothing sent");
            return Ok(0);
        }

        let recipients = payloads.len();
        let envelope = self.codec.seal(&RelayMessage::Batch { payloads }, &relay_key)?;
        if envelope.len() > MAX_RELAY_ENVELOPE_LEN {
            warn!(op = "send", len = envelope.len(), "message exceeds relay ceiling");
            return Err(SendError::TooLarge {
                len: envelope.len(),
                max: MAX_RELAY_ENVELOPE_LEN,
            });
        }
        if !self.send_frame(envelope) {
            return Err(SendError::NotConnected);
        }
        debug!(op = "send", kind, recipients, "channel message sent");
        Ok(recipients)
    }

    /// Change the local username and tell every peer with a pairwise key.
    /// Returns the number of peers notified.
    pub fn update_username(&mut self, name: &str) -> Result<usize, SendError> {
        let name = normalize_username(name).ok_or(SendError::EmptyUsername)?;
        let creds = self.credentials.as_mut().ok_or(SendError::MissingCredentials)?;
        creds.set_username(name.clone());

        if self.state != ConnectionState::Secured {
            return Ok(0);
        }
        let Some(relay_key) = self.relay_key().cloned() else {
            return Ok(0);
        };

        let message = PeerMessage::Username { name };
        let mut frames = Vec::new();
        for peer_id in self.roster.established() {
            let Some(key) = self.roster.get(&peer_id).and_then(|e| e.shared()) else {
                continue;
            };
            let payload = self.codec.seal(&message, key)?;
            frames.push(
                self.codec
                    .seal(&RelayMessage::Direct { payload, peer_id }, &relay_key)?,
            );
        }

        let notified = frames.len();
        for frame in frames {
            self.send_frame(frame);
        }
        debug!(op = "username", notified, "username updated");
        Ok(notified)
    }
}
