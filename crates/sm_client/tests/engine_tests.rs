mod common;

use std::time::Duration;

use common::{config, engine, engine_with, events, open, secure, sent, FakeRelay, Room};
use serde_json::json;
use sm_client::{
    ChannelData, ChannelMessage, ClientError, ClientEvent, CloseInfo, ConnectionState, Effect,
    Input, PeerSummary, SendError,
};
use sm_crypto::{hash::sha256_hex, EnvelopeCodec, EphemeralKeyPair, SymmetricKey};
use sm_proto::{PeerMessage, RelayMessage, SignedEphemeral};

fn alice() -> sm_client::Engine {
    let mut e = engine();
    e.set_credentials("alice", "lobby", "").unwrap();
    e
}

fn two_members() -> Room {
    let mut room = Room::new(FakeRelay::new(7));
    room.join("peer-a", "alice", "lobby", "hunter2");
    room.join("peer-b", "bob", "lobby", "hunter2");
    room
}

fn pairwise(room: &Room, owner: &str, peer: &str) -> Option<SymmetricKey> {
    room.member(owner)
        .engine
        .roster()
        .get(peer)
        .and_then(|e| e.shared())
        .cloned()
}

fn handshaken() -> Room {
    let mut room = two_members();
    room.roster("peer-a", &["peer-b"]);
    room.roster("peer-b", &["peer-a"]);
    room.settle();
    room
}

// ── Relay handshake and trust ────────────────────────────────────────────────

#[test]
fn first_relay_key_is_pinned_and_session_secured() {
    let relay = FakeRelay::new(1);
    let mut engine = alice();
    assert!(engine.trust().pinned().is_none());

    secure(&mut engine, &relay);

    assert_eq!(engine.state(), ConnectionState::Secured);
    assert!(engine.has_relay_session_key());
    assert_eq!(engine.trust().pinned(), Some(relay.public_b64()));
    assert_eq!(engine.reconnect_attempts(), 0);
}

#[test]
fn join_carries_only_the_room_hash() {
    let relay = FakeRelay::new(1);
    let mut engine = alice();
    engine.connect().unwrap();
    assert!(engine
        .take_effects()
        .contains(&Effect::OpenTransport { url: common::RELAY_URL.into() }));
    let hello = open(&mut engine);
    let (reply, key) = relay.accept(&hello);
    engine.handle(Input::Frame(relay.announcement()));
    let effects = engine.handle(Input::Frame(reply));
    let frames = sent(&effects);
    assert_eq!(
        relay.open(&frames[0], &key),
        RelayMessage::Join {
            room_hash: sha256_hex("lobby")
        }
    );
    assert!(!frames[0].contains("lobby"));
}

#[test]
fn mismatched_key_without_rotation_drops_connection_for_good() {
    let first = FakeRelay::new(1);
    let impostor = FakeRelay::new(2);
    let mut cfg = config();
    cfg.allow_server_key_rotation = false;
    let mut engine = engine_with(cfg);
    engine.set_credentials("alice", "lobby", "").unwrap();
    secure(&mut engine, &first);

    let effects = engine.handle(Input::TransportClosed(CloseInfo::abnormal("reset")));
    assert!(effects
        .iter()
        .any(|e| matches!(e, Effect::ScheduleReconnect { .. })));
    engine.handle(Input::ReconnectTimer);
    let hello = open(&mut engine);

    let effects = engine.handle(Input::Frame(impostor.announcement()));
    assert!(sent(&effects).is_empty());
    assert!(effects.contains(&Effect::CloseTransport));
    assert!(matches!(
        events(&effects).as_slice(),
        [ClientEvent::TrustRejected { .. }]
    ));
    assert_eq!(engine.state(), ConnectionState::Closing);

    // A signed reply racing the close is ignored.
    let (reply, _) = impostor.accept(&hello);
    assert!(sent(&engine.handle(Input::Frame(reply))).is_empty());
    assert!(!engine.has_relay_session_key());

    let effects = engine.handle(Input::TransportClosed(CloseInfo::clean(1000, "")));
    assert!(!effects
        .iter()
        .any(|e| matches!(e, Effect::ScheduleReconnect { .. })));
    assert!(events(&effects).is_empty());
    assert_eq!(engine.state(), ConnectionState::Disconnected);
    assert_eq!(engine.trust().pinned(), Some(first.public_b64()));
}

#[test]
fn repeated_bad_announcement_is_ignored_while_closing() {
    let first = FakeRelay::new(1);
    let impostor = FakeRelay::new(2);
    let mut cfg = config();
    cfg.allow_server_key_rotation = false;
    let mut engine = engine_with(cfg);
    engine.set_credentials("alice", "lobby", "").unwrap();
    secure(&mut engine, &first);
    engine.handle(Input::TransportClosed(CloseInfo::abnormal("reset")));
    engine.handle(Input::ReconnectTimer);
    open(&mut engine);

    let effects = engine.handle(Input::Frame(impostor.announcement()));
    assert_eq!(events(&effects).len(), 1);

    let effects = engine.handle(Input::Frame(impostor.announcement()));
    assert!(effects.is_empty());
    assert_eq!(engine.state(), ConnectionState::Closing);
}

#[test]
fn announcement_after_disconnect_does_not_touch_pin() {
    let first = FakeRelay::new(1);
    let rotated = FakeRelay::new(2);
    let mut engine = alice();
    secure(&mut engine, &first);

    engine.disconnect();
    assert_eq!(engine.state(), ConnectionState::Closing);

    let effects = engine.handle(Input::Frame(rotated.announcement()));
    assert!(events(&effects).is_empty());
    assert!(sent(&effects).is_empty());
    assert_eq!(engine.state(), ConnectionState::Closing);
    assert_eq!(engine.trust().pinned(), Some(first.public_b64()));
}

#[test]
fn rotation_replaces_pin_and_reports_both_fingerprints() {
    let first = FakeRelay::new(1);
    let rotated = FakeRelay::new(2);
    let mut engine = alice();
    secure(&mut engine, &first);
    engine.handle(Input::TransportClosed(CloseInfo::abnormal("reset")));
    engine.handle(Input::ReconnectTimer);
    let hello = open(&mut engine);

    let effects = engine.handle(Input::Frame(rotated.announcement()));
    assert_eq!(
        events(&effects),
        vec![ClientEvent::ServerKeyRotated {
            previous: Some(first.public_key().fingerprint()),
            current: rotated.public_key().fingerprint(),
        }]
    );
    assert_eq!(engine.state(), ConnectionState::EstablishingSession);

    let (reply, _) = rotated.accept(&hello);
    engine.handle(Input::Frame(reply));
    assert!(engine.is_secured());
    assert_eq!(engine.trust().pinned(), Some(rotated.public_b64()));
}

#[test]
fn bad_signature_leaves_session_unestablished() {
    let relay = FakeRelay::new(1);
    let forger = FakeRelay::new(9);
    let mut engine = alice();
    engine.connect().unwrap();
    let hello = open(&mut engine);
    engine.handle(Input::Frame(relay.announcement()));

    let (forged, _) = forger.accept(&hello);
    let effects = engine.handle(Input::Frame(forged));
    assert!(effects.is_empty());
    assert_eq!(engine.state(), ConnectionState::EstablishingSession);
    assert!(!engine.has_relay_session_key());

    // Signature over a different ephemeral than the one presented.
    let (good, _) = relay.accept(&hello);
    let mut spliced = SignedEphemeral::parse(&good).unwrap();
    spliced.ephemeral = EphemeralKeyPair::generate().public_bytes().to_vec();
    assert!(engine.handle(Input::Frame(spliced.to_frame())).is_empty());

    engine.handle(Input::Frame(good));
    assert!(engine.is_secured());
}

#[test]
fn bootstrap_key_verifies_without_announcement() {
    let relay = FakeRelay::new(1);
    let mut cfg = config();
    cfg.relay_public_key = Some(relay.public_b64());
    let mut engine = engine_with(cfg);
    engine.set_credentials("alice", "lobby", "").unwrap();
    engine.connect().unwrap();
    let hello = open(&mut engine);
    let (reply, _) = relay.accept(&hello);
    engine.handle(Input::Frame(reply));
    assert!(engine.is_secured());
}

#[test]
fn no_verifying_key_means_no_session() {
    let relay = FakeRelay::new(1);
    let mut engine = alice();
    engine.connect().unwrap();
    let hello = open(&mut engine);
    let (reply, _) = relay.accept(&hello);
    assert!(engine.handle(Input::Frame(reply)).is_empty());
    assert_eq!(engine.state(), ConnectionState::AwaitingRelayKey);
}

#[test]
fn undecryptable_relay_frame_is_dropped() {
    let relay = FakeRelay::new(1);
    let mut engine = alice();
    secure(&mut engine, &relay);
    let other = SymmetricKey::from_bytes([5; 32]);
    let frame = relay.seal(&RelayMessage::Roster { peers: vec!["x".into()] }, &other);
    assert!(engine.handle(Input::Frame(frame)).is_empty());
    assert!(engine.handle(Input::Frame("garbage".into())).is_empty());
    assert!(engine.roster().is_empty());
    assert!(engine.is_secured());
}

// ── Roster and peer handshake ────────────────────────────────────────────────

#[test]
fn both_sides_derive_the_same_pairwise_key() {
    let room = handshaken();
    let ab = pairwise(&room, "peer-a", "peer-b").expect("alice has key for bob");
    let ba = pairwise(&room, "peer-b", "peer-a").expect("bob has key for alice");
    assert_eq!(ab, ba);

    assert!(room.member("peer-a").events.contains(&ClientEvent::PeerSecured {
        peer_id: "peer-b".into(),
        username: "bob".into(),
    }));
    assert_eq!(
        room.member("peer-b").engine.peers(),
        vec![PeerSummary {
            peer_id: "peer-a".into(),
            username: "alice".into()
        }]
    );
}

#[test]
fn one_sided_snapshot_still_converges() {
    let mut room = two_members();
    room.roster("peer-a", &["peer-b"]);
    room.settle();

    assert_eq!(
        pairwise(&room, "peer-a", "peer-b"),
        pairwise(&room, "peer-b", "peer-a")
    );
    assert!(pairwise(&room, "peer-a", "peer-b").is_some());
    assert_eq!(room.member("peer-a").engine.peers().len(), 1);
    assert_eq!(room.member("peer-b").engine.peers().len(), 1);
}

#[test]
fn legacy_kdf_peers_converge() {
    let mut room = Room::new(FakeRelay::new(3));
    let mut legacy = config();
    legacy.legacy_xor_kdf = true;
    room.join_with("peer-a", "alice", "lobby", "pw", legacy.clone());
    room.join_with("peer-b", "bob", "lobby", "pw", legacy);
    room.roster("peer-a", &["peer-b"]);
    room.roster("peer-b", &["peer-a"]);
    room.settle();
    assert!(pairwise(&room, "peer-a", "peer-b").is_some());
    assert_eq!(room.member("peer-a").engine.peers().len(), 1);
}

#[test]
fn different_password_peers_never_become_visible() {
    let mut room = Room::new(FakeRelay::new(7));
    room.join("peer-a", "alice", "lobby", "right");
    room.join("peer-b", "mallory", "lobby", "wrong");
    room.roster("peer-a", &["peer-b"]);
    room.roster("peer-b", &["peer-a"]);
    room.settle();

    assert_ne!(
        pairwise(&room, "peer-a", "peer-b"),
        pairwise(&room, "peer-b", "peer-a")
    );
    for id in ["peer-a", "peer-b"] {
        let member = room.member(id);
        assert!(member.engine.peers().is_empty());
        assert!(!member
            .events
            .iter()
            .any(|e| matches!(e, ClientEvent::PeerSecured { .. })));
    }
}

#[test]
fn repeated_snapshot_keeps_keys_and_sends_nothing() {
    let mut room = handshaken();
    let before = pairwise(&room, "peer-a", "peer-b");
    let relay = FakeRelay::new(7);
    let member = room.member_mut("peer-a");
    let frame = relay.seal(
        &RelayMessage::Roster {
            peers: vec!["peer-b".into()],
        },
        &member.key,
    );
    let effects = member.engine.handle(Input::Frame(frame));
    assert!(sent(&effects).is_empty());
    assert_eq!(
        events(&effects),
        vec![ClientEvent::PeerList {
            peers: vec![PeerSummary {
                peer_id: "peer-b".into(),
                username: "bob".into()
            }]
        }]
    );
    assert_eq!(pairwise(&room, "peer-a", "peer-b"), before);
}

#[test]
fn absent_peers_are_removed() {
    let mut room = handshaken();
    room.roster("peer-a", &[]);
    room.settle();
    let member = room.member("peer-a");
    assert!(member.engine.roster().is_empty());
    assert_eq!(
        member.events.last(),
        Some(&ClientEvent::PeerList { peers: vec![] })
    );
}

#[test]
fn new_peers_get_one_batched_offer() {
    let relay = FakeRelay::new(1);
    let mut engine = alice();
    let key = secure(&mut engine, &relay);
    let frame = relay.seal(
        &RelayMessage::Roster {
            peers: vec!["p1".into(), "p2".into(), "p3".into()],
        },
        &key,
    );
    let frames = sent(&engine.handle(Input::Frame(frame)));
    assert_eq!(frames.len(), 1);
    match relay.open(&frames[0], &key) {
        RelayMessage::Batch { payloads } => {
            assert_eq!(payloads.len(), 3);
            for (id, hex_key) in payloads {
                let entry = engine.roster().get(&id).unwrap();
                assert_eq!(entry.public_hex(), hex_key);
                assert!(entry.shared().is_none());
            }
        }
        other => panic!("expected batch, got {other:?}"),
    }
}

#[test]
fn duplicate_handshake_does_not_replace_key() {
    let mut room = handshaken();
    let before = pairwise(&room, "peer-a", "peer-b");
    let stray = EphemeralKeyPair::generate().public_hex();
    room.direct("peer-b", "peer-a", stray);
    room.settle();
    assert_eq!(pairwise(&room, "peer-a", "peer-b"), before);
    assert_eq!(room.member("peer-a").engine.peers().len(), 1);
}

#[test]
fn channel_message_before_username_is_dropped() {
    let mut room = two_members();
    room.roster("peer-a", &["peer-b"]);
    room.roster("peer-b", &["peer-a"]);
    // Let key offers through, hold back the sealed usernames.
    room.settle_filtered(&|_, _, payload| !payload.contains('|'));

    let key = pairwise(&room, "peer-a", "peer-b").expect("key established");
    assert!(room.member("peer-a").engine.peers().is_empty());

    let codec = EnvelopeCodec::new();
    let message = PeerMessage::Channel {
        kind: "text".into(),
        data: "early".into(),
    };
    room.direct("peer-b", "peer-a", codec.seal(&message, &key).unwrap());
    room.settle();
    assert!(!room
        .member("peer-a")
        .events
        .iter()
        .any(|e| matches!(e, ClientEvent::Message(_))));

    let hello = PeerMessage::Username { name: " bob ".into() };
    room.direct("peer-b", "peer-a", codec.seal(&hello, &key).unwrap());
    room.direct("peer-b", "peer-a", codec.seal(&message, &key).unwrap());
    room.settle();

    let events = &room.member("peer-a").events;
    assert!(events.contains(&ClientEvent::PeerSecured {
        peer_id: "peer-b".into(),
        username: "bob".into()
    }));
    assert_eq!(
        events.last(),
        Some(&ClientEvent::Message(ChannelMessage {
            peer_id: "peer-b".into(),
            username: "bob".into(),
            kind: "text".into(),
            data: ChannelData::Text("early".into()),
        }))
    );
}

// ── Outbound traffic ─────────────────────────────────────────────────────────

#[test]
fn channel_message_reaches_established_peer() {
    let mut room = handshaken();
    let sent_to = room
        .member_mut("peer-a")
        .engine
        .send_channel_message("text", "hello")
        .unwrap();
    assert_eq!(sent_to, 1);

    let structured = match json!({"x": 1, "y": [2, 3]}) {
        serde_json::Value::Object(map) => ChannelData::Structured(map),
        _ => unreachable!(),
    };
    room.member_mut("peer-a")
        .engine
        .send_channel_message("cursor", structured.clone())
        .unwrap();
    room.settle();

    let received: Vec<&ChannelMessage> = room
        .member("peer-b")
        .events
        .iter()
        .filter_map(|e| match e {
            ClientEvent::Message(m) => Some(m),
            _ => None,
        })
        .collect();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].peer_id, "peer-a");
    assert_eq!(received[0].username, "alice");
    assert_eq!(received[0].kind, "text");
    assert_eq!(received[0].data, ChannelData::Text("hello".into()));
    assert_eq!(received[1].data, structured);
}

#[test]
fn send_with_no_peers_sends_nothing() {
    let relay = FakeRelay::new(1);
    let mut engine = alice();
    secure(&mut engine, &relay);
    assert_eq!(engine.send_channel_message("text", "anyone?").unwrap(), 0);
    assert!(engine.take_effects().is_empty());
}

#[test]
fn send_before_secured_is_refused() {
    let mut engine = alice();
    assert!(matches!(
        engine.send_channel_message("text", "hi"),
        Err(SendError::NotSecured)
    ));
    engine.connect().unwrap();
    open(&mut engine);
    assert!(matches!(
        engine.send_channel_message("text", "hi"),
        Err(SendError::NotSecured)
    ));
}

#[test]
fn oversized_message_is_rejected() {
    let mut room = handshaken();
    let engine = &mut room.member_mut("peer-a").engine;
    engine.take_effects();
    let big = "x".repeat(9 * 1024 * 1024);
    assert!(matches!(
        engine.send_channel_message("text", big),
        Err(SendError::TooLarge { .. })
    ));
    assert!(engine.take_effects().is_empty());
}

#[test]
fn username_change_reaches_peers() {
    let mut room = handshaken();
    let engine = &mut room.member_mut("peer-a").engine;
    assert!(matches!(
        engine.update_username("   "),
        Err(SendError::EmptyUsername)
    ));
    assert_eq!(engine.update_username("  alicia ").unwrap(), 1);
    assert_eq!(engine.credentials().unwrap().username(), "alicia");
    room.settle();

    assert!(room.member("peer-b").events.contains(&ClientEvent::PeerSecured {
        peer_id: "peer-a".into(),
        username: "alicia".into()
    }));
    assert_eq!(room.member("peer-b").engine.peers()[0].username, "alicia");
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

#[test]
fn connect_requires_credentials() {
    let mut engine = engine();
    assert!(matches!(engine.connect(), Err(ClientError::MissingCredentials)));
    assert!(engine.take_effects().is_empty());
}

#[test]
fn unexpected_close_backs_off_geometrically() {
    let relay = FakeRelay::new(1);
    let mut engine = alice();
    secure(&mut engine, &relay);

    let info = CloseInfo::clean(1006, "gone");
    let effects = engine.handle(Input::TransportClosed(info.clone()));
    assert!(effects.contains(&Effect::ScheduleReconnect {
        delay: Duration::from_millis(3000),
        attempt: 1
    }));
    assert_eq!(events(&effects), vec![ClientEvent::ServerClosed(info)]);
    assert_eq!(engine.state(), ConnectionState::Reconnecting);
    assert!(engine.roster().is_empty());
    assert!(!engine.has_relay_session_key());

    let effects = engine.handle(Input::ReconnectTimer);
    assert!(effects
        .iter()
        .any(|e| matches!(e, Effect::OpenTransport { url } if url == common::RELAY_URL)));
    let effects = engine.handle(Input::TransportClosed(CloseInfo::abnormal("refused")));
    assert!(effects.contains(&Effect::ScheduleReconnect {
        delay: Duration::from_millis(5400),
        attempt: 2
    }));

    // A successful open resets the counter.
    engine.handle(Input::ReconnectTimer);
    engine.handle(Input::TransportOpened);
    assert_eq!(engine.reconnect_attempts(), 0);
}

#[test]
fn disconnect_suppresses_reconnect_and_is_idempotent() {
    let relay = FakeRelay::new(1);
    let mut engine = alice();
    secure(&mut engine, &relay);

    engine.disconnect();
    let effects = engine.take_effects();
    assert!(effects.contains(&Effect::CloseTransport));
    assert!(effects.contains(&Effect::CancelReconnect));
    assert_eq!(engine.state(), ConnectionState::Closing);

    engine.disconnect();
    assert!(engine.take_effects().is_empty());

    let effects = engine.handle(Input::TransportClosed(CloseInfo::clean(1000, "")));
    assert!(!effects
        .iter()
        .any(|e| matches!(e, Effect::ScheduleReconnect { .. })));
    assert!(events(&effects).is_empty());
    assert_eq!(engine.state(), ConnectionState::Disconnected);
}

#[test]
fn disconnect_while_reconnecting_cancels_timer() {
    let relay = FakeRelay::new(1);
    let mut engine = alice();
    secure(&mut engine, &relay);
    engine.handle(Input::TransportClosed(CloseInfo::abnormal("reset")));

    engine.disconnect();
    let effects = engine.take_effects();
    assert!(effects.contains(&Effect::CancelReconnect));
    assert!(!effects.contains(&Effect::CloseTransport));
    assert_eq!(engine.state(), ConnectionState::Disconnected);
    assert!(engine.handle(Input::ReconnectTimer).is_empty());
}

#[test]
fn teardown_forgets_credentials() {
    let relay = FakeRelay::new(1);
    let mut engine = alice();
    secure(&mut engine, &relay);
    engine.teardown();
    assert!(engine.credentials().is_none());
    engine.handle(Input::TransportClosed(CloseInfo::clean(1000, "")));
    assert!(matches!(engine.connect(), Err(ClientError::MissingCredentials)));
}

#[test]
fn heartbeat_pings_and_closes_after_missed_limit() {
    let relay = FakeRelay::new(1);
    let mut cfg = config();
    cfg.heartbeat_miss_limit = 2;
    let mut engine = engine_with(cfg);
    engine.set_credentials("alice", "lobby", "").unwrap();
    secure(&mut engine, &relay);

    let ping = Effect::Send("ping".into());
    assert_eq!(engine.handle(Input::HeartbeatTick), vec![ping.clone()]);
    engine.handle(Input::Frame("pong".into()));
    assert_eq!(engine.handle(Input::HeartbeatTick), vec![ping.clone()]);
    assert_eq!(engine.handle(Input::HeartbeatTick), vec![ping]);
    assert_eq!(
        engine.handle(Input::HeartbeatTick),
        vec![Effect::CloseTransport]
    );
}

#[test]
fn heartbeat_without_limit_never_closes() {
    let relay = FakeRelay::new(1);
    let mut engine = alice();
    secure(&mut engine, &relay);
    for _ in 0..10 {
        assert_eq!(
            engine.handle(Input::HeartbeatTick),
            vec![Effect::Send("ping".into())]
        );
    }
}
