//! Connection state machine.
//!
//! The engine performs no I/O. Transport and timer happenings come in
//! through [`Engine::handle`]; application calls are plain methods. Both
//! queue [`Effect`]s for a driver to carry out in order.
//!
//! ```text
//! Disconnected ─connect─▶ Connecting ─open─▶ AwaitingRelayKey
//!   AwaitingRelayKey ─trusted server-key─▶ EstablishingSession
//!   Awaiting/Establishing ─valid signed reply─▶ Secured
//!   any ─close (unhandled)─▶ Reconnecting ─timer─▶ Connecting
//!   any ─disconnect / untrusted key─▶ Closing ─close─▶ Disconnected
//! ```

mod router;

use serde::Serialize;
use serde_json::Value;
use sm_crypto::{kdf, EnvelopeCodec, EphemeralKeyPair, RelayPublicKey, SymmetricKey};
use sm_proto::{InboundFrame, RelayMessage, SignedEphemeral, PING_TOKEN};
use sm_store::{StoreError, TrustAnchor, TrustDecision};
use tracing::{debug, error, info, trace, warn};

use crate::{
    backoff::ReconnectPolicy,
    config::ClientConfig,
    credentials::Credentials,
    error::ClientError,
    events::{ClientEvent, CloseInfo, Effect, Input, PeerSummary},
    roster::Roster,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Transport open, our ephemeral key sent; waiting for the relay's key
    /// announcement or its signed reply.
    AwaitingRelayKey,
    /// A trusted key announcement arrived; waiting for the signed reply.
    EstablishingSession,
    Secured,
    Closing,
    Reconnecting,
}

/// Relay-facing key material for one connection.
struct RelaySession {
    keys: EphemeralKeyPair,
    shared: Option<SymmetricKey>,
}

pub struct Engine {
    config: ClientConfig,
    policy: ReconnectPolicy,
    codec: EnvelopeCodec,
    trust: TrustAnchor,
    bootstrap_key: Option<RelayPublicKey>,
    announced_key: Option<RelayPublicKey>,
    credentials: Option<Credentials>,
    state: ConnectionState,
    relay: Option<RelaySession>,
    roster: Roster,
    transport_open: bool,
    close_handled: bool,
    reconnect_attempts: u32,
    missed_heartbeats: u32,
    legacy_warned: bool,
    effects: Vec<Effect>,
}

impl Engine {
    /// Validate `config` and build an engine pinning into the configured
    /// stores.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let trust = config.trust_anchor();
        Ok(Self::with_trust(config, trust))
    }

    pub fn with_trust(config: ClientConfig, trust: TrustAnchor) -> Self {
        Self {
            policy: config.reconnect_policy(),
            bootstrap_key: config.bootstrap_key(),
            config,
            codec: EnvelopeCodec::new(),
            trust,
            announced_key: None,
            credentials: None,
            state: ConnectionState::Disconnected,
            relay: None,
            roster: Roster::new(),
            transport_open: false,
            close_handled: true,
            reconnect_attempts: 0,
            missed_heartbeats: 0,
            legacy_warned: false,
            effects: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_secured(&self) -> bool {
        self.state == ConnectionState::Secured
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn peers(&self) -> Vec<PeerSummary> {
        self.roster.visible()
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn trust(&self) -> &TrustAnchor {
        &self.trust
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn has_relay_session_key(&self) -> bool {
        self.relay_key().is_some()
    }

    /// Drain queued effects.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub fn set_credentials(
        &mut self,
        username: &str,
        room: &str,
        password: &str,
    ) -> Result<(), ClientError> {
        let creds = Credentials::new(username, room, password)?;
        debug!(op = "credentials", room_hash = %creds.room_hash(), "credentials set");
        self.credentials = Some(creds);
        Ok(())
    }

    /// Drop the pinned relay key so the next announcement is trusted on
    /// first use again.
    pub fn forget_relay_key(&mut self) {
        info!(op = "trust", namespace = %self.trust.namespace(), "forgetting pinned relay key");
        self.trust.clear();
        self.announced_key = None;
    }

    /// Open a fresh transport. Any pending reconnect is cancelled and all
    /// per-connection state is discarded.
    pub fn connect(&mut self) -> Result<(), ClientError> {
        if self.credentials.is_none() {
            return Err(ClientError::MissingCredentials);
        }
        self.push(Effect::CancelReconnect);
        self.push(Effect::StopHeartbeat);
        self.reset_session();
        self.relay = Some(RelaySession {
            keys: EphemeralKeyPair::generate(),
            shared: None,
        });
        self.close_handled = false;
        self.transport_open = false;
        self.legacy_warned = false;
        self.state = ConnectionState::Connecting;
        info!(
            op = "connect",
            url = %self.config.relay_url,
            attempt = self.reconnect_attempts,
            "opening relay connection"
        );
        self.push(Effect::OpenTransport {
            url: self.config.relay_url.clone(),
        });
        Ok(())
    }

    /// Close without scheduling a reconnect. Calling it again is a no-op.
    pub fn disconnect(&mut self) {
        if self.close_handled
            && matches!(
                self.state,
                ConnectionState::Closing | ConnectionState::Disconnected
            )
        {
            return;
        }
        info!(op = "disconnect", state = ?self.state, "closing relay connection");
        self.shut_down();
    }

    /// Disconnect and forget credentials.
    pub fn teardown(&mut self) {
        self.disconnect();
        self.credentials = None;
        debug!(op = "teardown", "client torn down");
    }

    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        match input {
            Input::TransportOpened => self.on_opened(),
            Input::Frame(text) => self.on_frame(&text),
            Input::TransportError(err) => self.on_error(&err),
            Input::TransportClosed(info) => self.on_closed(info),
            Input::HeartbeatTick => self.on_heartbeat(),
            Input::ReconnectTimer => self.on_reconnect_timer(),
        }
        self.take_effects()
    }

    // ── Transport events ──────────────────────────────────────────────────

    fn on_opened(&mut self) {
        if self.state != ConnectionState::Connecting {
            debug!(op = "open", state = ?self.state, "ignoring open outside connecting state");
            return;
        }
        let Some(hello) = self.relay.as_ref().map(|r| r.keys.public_hex()) else {
            return;
        };
        self.transport_open = true;
        self.reconnect_attempts = 0;
        self.missed_heartbeats = 0;
        self.state = ConnectionState::AwaitingRelayKey;
        debug!(op = "open", "transport open; sending ephemeral key");
        self.push(Effect::StartHeartbeat {
            interval: self.config.ping_interval(),
        });
        self.send_frame(hello);
    }

    fn on_frame(&mut self, text: &str) {
        if !self.transport_open {
            return;
        }
        // After a local shutdown nothing from the old socket is acted on.
        if self.close_handled || self.state == ConnectionState::Closing {
            trace!(op = "frame", state = ?self.state, "dropping frame after shutdown");
            return;
        }
        self.missed_heartbeats = 0;
        trace!(op = "frame", len = text.len(), state = ?self.state, "inbound frame");
        match InboundFrame::classify(text) {
            InboundFrame::Pong => {}
            InboundFrame::ServerKey(key) => self.on_server_key(&key),
            InboundFrame::Other(body) => match self.state {
                ConnectionState::AwaitingRelayKey | ConnectionState::EstablishingSession => {
                    self.on_signed_reply(body)
                }
                ConnectionState::Secured => self.on_sealed(body),
                state => debug!(op = "frame", ?state, "dropping frame"),
            },
        }
    }

    fn on_server_key(&mut self, key_b64: &str) {
        let key = match RelayPublicKey::from_b64(key_b64) {
            Ok(key) => key,
            Err(err) => {
                warn!(op = "server_key", error = %err, "ignoring malformed relay key announcement");
                return;
            }
        };

        match self.trust.check(&key) {
            Ok(TrustDecision::FirstUse) | Ok(TrustDecision::Matched) => {}
            Ok(TrustDecision::Rotated { previous }) => {
                let previous = previous.map(|previous| {
                    RelayPublicKey::from_b64(&previous)
                        .map(|k| k.fingerprint())
                        .unwrap_or(previous)
                });
                self.emit(ClientEvent::ServerKeyRotated {
                    previous,
                    current: key.fingerprint(),
                });
            }
            Err(StoreError::KeyMismatch {
                pinned, presented, ..
            }) => {
                error!(
                    op = "server_key",
                    %pinned,
                    %presented,
                    "relay key does not match pin; dropping connection"
                );
                self.emit(ClientEvent::TrustRejected {
                    pinned: Some(pinned),
                    presented,
                });
                self.shut_down();
                return;
            }
            Err(StoreError::PinUnreadable { tier, reason, .. }) => {
                error!(
                    op = "server_key",
                    tier,
                    %reason,
                    presented = %key.fingerprint(),
                    "stored relay pin unreadable; dropping connection"
                );
                self.emit(ClientEvent::TrustRejected {
                    pinned: None,
                    presented: key.fingerprint(),
                });
                self.shut_down();
                return;
            }
            Err(err) => {
                warn!(op = "server_key", error = %err, "trust check failed");
                return;
            }
        }

        self.announced_key = Some(key);
        if self.state == ConnectionState::AwaitingRelayKey {
            self.state = ConnectionState::EstablishingSession;
        }
    }

    fn on_signed_reply(&mut self, body: &str) {
        if self.relay.as_ref().map_or(true, |r| r.shared.is_some()) {
            return;
        }
        let Some(verifier) = self.verifying_key() else {
            warn!(op = "signed_reply", "no relay key to verify against; waiting for announcement");
            return;
        };
        let signed = match SignedEphemeral::parse(body) {
            Ok(signed) => signed,
            Err(err) => {
                debug!(op = "signed_reply", error = %err, "dropping unexpected frame");
                return;
            }
        };
        if let Err(err) = verifier.verify_ephemeral(&signed.ephemeral, &signed.signature) {
            warn!(
                op = "signed_reply",
                fingerprint = %verifier.fingerprint(),
                error = %err,
                "relay signature rejected"
            );
            return;
        }

        let derived = match &self.relay {
            Some(relay) => relay
                .keys
                .diffie_hellman(&signed.ephemeral)
                .and_then(|bits| kdf::relay_session_key(&bits[..])),
            None => return,
        };
        let key = match derived {
            Ok(key) => key,
            Err(err) => {
                warn!(op = "signed_reply", error = %err, "relay key agreement failed");
                return;
            }
        };
        if let Some(relay) = self.relay.as_mut() {
            relay.shared = Some(key);
        }
        self.state = ConnectionState::Secured;
        info!(op = "signed_reply", fingerprint = %verifier.fingerprint(), "relay session secured");

        if let Some(room_hash) = self.credentials.as_ref().map(|c| c.room_hash().to_string()) {
            self.send_relay(&RelayMessage::Join { room_hash });
        }
        self.emit(ClientEvent::ServerSecured);
    }

    fn on_sealed(&mut self, body: &str) {
        let Some(key) = self.relay_key() else {
            return;
        };
        let value: Value = match self.codec.open(body, key) {
            Ok(value) => value,
            Err(err) => {
                warn!(op = "relay_open", error = %err, "dropping undecryptable relay frame");
                return;
            }
        };
        match RelayMessage::from_value(value) {
            Ok(msg) => self.route(msg),
            Err(err) => debug!(op = "relay_open", error = %err, "dropping unrecognised relay action"),
        }
    }

    fn on_error(&mut self, err: &str) {
        warn!(op = "transport", error = %err, "transport error");
        if self.transport_open {
            self.push(Effect::CloseTransport);
        }
    }

    fn on_closed(&mut self, info: CloseInfo) {
        let handled = self.close_handled;
        self.transport_open = false;
        self.close_handled = true;
        self.push(Effect::StopHeartbeat);
        self.reset_session();

        if handled {
            debug!(op = "close", "transport closed after local shutdown");
            self.state = ConnectionState::Disconnected;
            return;
        }

        info!(
            op = "close",
            code = ?info.code,
            reason = %info.reason,
            clean = info.was_clean,
            "relay connection closed"
        );
        if self.credentials.is_some() {
            let delay = self.policy.delay(self.reconnect_attempts);
            self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
            self.state = ConnectionState::Reconnecting;
            debug!(op = "close", delay_ms = delay.as_millis() as u64, attempt = self.reconnect_attempts, "scheduling reconnect");
            self.push(Effect::ScheduleReconnect {
                delay,
                attempt: self.reconnect_attempts,
            });
        } else {
            self.state = ConnectionState::Disconnected;
        }
        self.emit(ClientEvent::ServerClosed(info));
    }

    fn on_heartbeat(&mut self) {
        if !self.transport_open {
            return;
        }
        let limit = self.config.heartbeat_miss_limit;
        if limit > 0 {
            if self.missed_heartbeats >= limit {
                warn!(op = "heartbeat", missed = self.missed_heartbeats, "relay unresponsive; closing transport");
                self.push(Effect::CloseTransport);
                return;
            }
            self.missed_heartbeats += 1;
        }
        self.send_frame(PING_TOKEN.to_string());
    }

    fn on_reconnect_timer(&mut self) {
        if self.state != ConnectionState::Reconnecting {
            debug!(op = "reconnect", state = ?self.state, "stale reconnect timer");
            return;
        }
        if let Err(err) = self.connect() {
            warn!(op = "reconnect", error = %err, "reconnect abandoned");
            self.state = ConnectionState::Disconnected;
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────

    fn shut_down(&mut self) {
        self.close_handled = true;
        self.push(Effect::CancelReconnect);
        self.push(Effect::StopHeartbeat);
        let live = self.transport_open || self.state == ConnectionState::Connecting;
        self.reset_session();
        if live {
            self.push(Effect::CloseTransport);
            self.state = ConnectionState::Closing;
        } else {
            self.state = ConnectionState::Disconnected;
        }
    }

    fn reset_session(&mut self) {
        self.relay = None;
        self.announced_key = None;
        self.roster.clear();
        self.missed_heartbeats = 0;
    }

    /// Announced-and-trusted key, else the pin, else the bootstrap key.
    fn verifying_key(&self) -> Option<RelayPublicKey> {
        self.announced_key
            .clone()
            .or_else(|| self.trust.pinned_key())
            .or_else(|| self.bootstrap_key.clone())
    }

    fn relay_key(&self) -> Option<&SymmetricKey> {
        self.relay.as_ref()?.shared.as_ref()
    }

    fn push(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    fn emit(&mut self, event: ClientEvent) {
        self.effects.push(Effect::Emit(event));
    }

    /// Queue a raw frame. `false` when no transport is open.
    fn send_frame(&mut self, frame: String) -> bool {
        if !self.transport_open {
            debug!(op = "send", "transport not open; frame dropped");
            return false;
        }
        self.push(Effect::Send(frame));
        true
    }

    fn seal_relay(&self, msg: &RelayMessage) -> Option<String> {
        let key = self.relay_key()?;
        match self.codec.seal(msg, key) {
            Ok(envelope) => Some(envelope),
            Err(err) => {
                warn!(op = "relay_seal", action = msg.action(), error = %err, "could not seal relay frame");
                None
            }
        }
    }

    fn send_relay(&mut self, msg: &RelayMessage) -> bool {
        match self.seal_relay(msg) {
            Some(envelope) => self.send_frame(envelope),
            None => false,
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .field("relay_url", &self.config.relay_url)
            .field("peers", &self.roster.len())
            .field("reconnect_attempts", &self.reconnect_attempts)
            .finish_non_exhaustive()
    }
}
