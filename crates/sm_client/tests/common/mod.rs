//! Scripted relay used by the engine and driver tests.
#![allow(dead_code)]

use std::collections::VecDeque;

use ed25519_dalek::{Signer, SigningKey};
use serde_json::Value;
use sm_client::{ClientConfig, ClientEvent, Effect, Engine, Input};
use sm_crypto::{kdf, EnvelopeCodec, EphemeralKeyPair, RelayPublicKey, SymmetricKey};
use sm_proto::{frame::ServerKeyAnnouncement, RelayMessage, SignedEphemeral, PING_TOKEN};
use sm_store::{namespace_for_host, TrustAnchor};

pub const RELAY_URL: &str = "ws://relay.test:9000";

pub struct FakeRelay {
    signing: SigningKey,
    codec: EnvelopeCodec,
}

impl FakeRelay {
    pub fn new(seed: u8) -> Self {
        Self {
            signing: SigningKey::from_bytes(&[seed; 32]),
            codec: EnvelopeCodec::new(),
        }
    }

    pub fn public_key(&self) -> RelayPublicKey {
        RelayPublicKey::from_bytes(self.signing.verifying_key().as_bytes()).unwrap()
    }

    pub fn public_b64(&self) -> String {
        self.public_key().to_b64()
    }

    pub fn announcement(&self) -> String {
        ServerKeyAnnouncement::new(self.public_b64()).to_frame()
    }

    /// Answer a client's hex ephemeral key. Returns the signed reply frame
    /// and the relay-session key both sides end up with.
    pub fn accept(&self, client_hello: &str) -> (String, SymmetricKey) {
        let eph = EphemeralKeyPair::generate();
        let signature = self.signing.sign(&eph.public_bytes());
        let bits = eph.diffie_hellman_hex(client_hello).unwrap();
        let key = kdf::relay_session_key(&bits[..]).unwrap();
        let frame = SignedEphemeral {
            ephemeral: eph.public_bytes().to_vec(),
            signature: signature.to_bytes().to_vec(),
        }
        .to_frame();
        (frame, key)
    }

    pub fn seal(&self, msg: &RelayMessage, key: &SymmetricKey) -> String {
        self.codec.seal(msg, key).unwrap()
    }

    pub fn open(&self, frame: &str, key: &SymmetricKey) -> RelayMessage {
        let value: Value = self.codec.open(frame, key).unwrap();
        RelayMessage::from_value(value).unwrap()
    }
}

pub fn config() -> ClientConfig {
    let mut config = ClientConfig::new(RELAY_URL);
    config.reconnect_jitter_ms = 0;
    config
}

/// Engine with an in-memory-only pin.
pub fn engine_with(config: ClientConfig) -> Engine {
    let trust = TrustAnchor::new(
        namespace_for_host(config.relay_host().as_deref()),
        config.allow_server_key_rotation,
    );
    Engine::with_trust(config, trust)
}

pub fn engine() -> Engine {
    engine_with(config())
}

pub fn sent(effects: &[Effect]) -> Vec<String> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::Send(frame) if frame != PING_TOKEN => Some(frame.clone()),
            _ => None,
        })
        .collect()
}

pub fn events(effects: &[Effect]) -> Vec<ClientEvent> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::Emit(event) => Some(event.clone()),
            _ => None,
        })
        .collect()
}

/// Report the transport open and return the client's hello frame. Effects
/// queued before the open are discarded.
pub fn open(engine: &mut Engine) -> String {
    engine.take_effects();
    let effects = engine.handle(Input::TransportOpened);
    let mut frames = sent(&effects);
    assert_eq!(frames.len(), 1, "hello expected, got {effects:?}");
    frames.remove(0)
}

/// Full relay handshake on an engine with credentials already set. Returns
/// the relay-session key.
pub fn secure(engine: &mut Engine, relay: &FakeRelay) -> SymmetricKey {
    engine.connect().unwrap();
    let hello = open(engine);
    let (reply, key) = relay.accept(&hello);
    let mut effects = engine.handle(Input::Frame(relay.announcement()));
    effects.extend(engine.handle(Input::Frame(reply)));
    let frames = sent(&effects);
    assert_eq!(frames.len(), 1, "join expected, got {effects:?}");
    assert!(matches!(relay.open(&frames[0], &key), RelayMessage::Join { .. }));
    assert!(events(&effects).contains(&ClientEvent::ServerSecured));
    key
}

pub struct Member {
    pub id: String,
    pub engine: Engine,
    pub key: SymmetricKey,
    pub events: Vec<ClientEvent>,
}

type Filter = dyn Fn(&str, &str, &str) -> bool;

/// Several secured engines behind one relay that routes `c` / `w` frames.
pub struct Room {
    pub relay: FakeRelay,
    pub members: Vec<Member>,
    inbox: VecDeque<(usize, String)>,
}

impl Room {
    pub fn new(relay: FakeRelay) -> Self {
        Self {
            relay,
            members: Vec::new(),
            inbox: VecDeque::new(),
        }
    }

    /// Add a secured member. `config` lets tests flip the KDF mode.
    pub fn join_with(
        &mut self,
        id: &str,
        username: &str,
        room: &str,
        password: &str,
        config: ClientConfig,
    ) -> usize {
        let mut engine = engine_with(config);
        engine.set_credentials(username, room, password).unwrap();
        let key = secure(&mut engine, &self.relay);
        self.members.push(Member {
            id: id.to_string(),
            engine,
            key,
            events: Vec::new(),
        });
        self.members.len() - 1
    }

    pub fn join(&mut self, id: &str, username: &str, room: &str, password: &str) -> usize {
        self.join_with(id, username, room, password, config())
    }

    pub fn member(&self, id: &str) -> &Member {
        &self.members[self.index(id)]
    }

    pub fn member_mut(&mut self, id: &str) -> &mut Member {
        let idx = self.index(id);
        &mut self.members[idx]
    }

    fn index(&self, id: &str) -> usize {
        self.members
            .iter()
            .position(|m| m.id == id)
            .unwrap_or_else(|| panic!("unknown member {id}"))
    }

    /// Queue a roster snapshot for `to`.
    pub fn roster(&mut self, to: &str, peers: &[&str]) {
        let idx = self.index(to);
        let msg = RelayMessage::Roster {
            peers: peers.iter().map(|p| p.to_string()).collect(),
        };
        let frame = self.relay.seal(&msg, &self.members[idx].key);
        self.inbox.push_back((idx, frame));
    }

    /// Queue a direct frame from `from` to `to` as the relay would route it.
    pub fn direct(&mut self, from: &str, to: &str, payload: String) {
        let idx = self.index(to);
        let msg = RelayMessage::Direct {
            payload,
            peer_id: from.to_string(),
        };
        let frame = self.relay.seal(&msg, &self.members[idx].key);
        self.inbox.push_back((idx, frame));
    }

    /// Route until quiet.
    pub fn settle(&mut self) {
        self.settle_filtered(&|_, _, _| true);
    }

    /// Route until quiet, dropping peer payloads for which
    /// `allow(from, to, payload)` is false.
    pub fn settle_filtered(&mut self, allow: &Filter) {
        loop {
            for idx in 0..self.members.len() {
                let effects = self.members[idx].engine.take_effects();
                self.absorb(idx, effects, allow);
            }
            let Some((to, frame)) = self.inbox.pop_front() else {
                break;
            };
            let effects = self.members[to].engine.handle(Input::Frame(frame));
            self.absorb(to, effects, allow);
        }
    }

    fn absorb(&mut self, from: usize, effects: Vec<Effect>, allow: &Filter) {
        for effect in effects {
            match effect {
                Effect::Send(frame) if frame != PING_TOKEN => {
                    let msg = self.relay.open(&frame, &self.members[from].key);
                    self.route(from, msg, allow);
                }
                Effect::Emit(event) => self.members[from].events.push(event),
                _ => {}
            }
        }
    }

    fn route(&mut self, from: usize, msg: RelayMessage, allow: &Filter) {
        let sender = self.members[from].id.clone();
        let deliveries: Vec<(String, String)> = match msg {
            RelayMessage::Direct { payload, peer_id } => vec![(peer_id, payload)],
            RelayMessage::Batch { payloads } => payloads.into_iter().collect(),
            RelayMessage::Join { .. } => Vec::new(),
            RelayMessage::Roster { .. } => panic!("client sent a roster snapshot"),
        };
        for (to, payload) in deliveries {
            if allow(&sender, &to, &payload) {
                self.direct(&sender, &to, payload);
            }
        }
    }
}
