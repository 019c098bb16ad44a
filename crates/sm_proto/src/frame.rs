//! Plaintext frames outside the envelope format.
//!
//! Only three kinds of text ever cross the wire unsealed:
//!   - the client's ephemeral public key (hex), sent once after open
//!   - the relay's handshake frames: the server-key announcement
//!     (`{"type":"server-key","key":<b64>}`) and the signed ephemeral reply
//!     (`hex(ephemeral)|b64(signature)`)
//!   - heartbeat tokens (`ping` / `pong`)

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

pub const PING_TOKEN: &str = "ping";
pub const PONG_TOKEN: &str = "pong";

/// Relay envelopes longer than this are never sent (8 MiB).
pub const MAX_RELAY_ENVELOPE_LEN: usize = 8 * 1024 * 1024;

const SERVER_KEY_TYPE: &str = "server-key";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerKeyAnnouncement {
    #[serde(rename = "type")]
    pub kind: String,
    pub key: String,
}

impl ServerKeyAnnouncement {
    pub fn new(key_b64: impl Into<String>) -> Self {
        Self {
            kind: SERVER_KEY_TYPE.to_string(),
            key: key_b64.into(),
        }
    }

    pub fn to_frame(&self) -> String {
        // A two-string struct cannot fail to serialise.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// First-pass classification of an inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame<'a> {
    /// Heartbeat reply; no protocol action.
    Pong,
    /// Relay long-term key announcement (base64 Ed25519 key).
    ServerKey(String),
    /// Anything else: the signed reply before the session is up, a sealed
    /// envelope afterwards.
    Other(&'a str),
}

impl<'a> InboundFrame<'a> {
    pub fn classify(text: &'a str) -> Self {
        if text == PONG_TOKEN {
            return InboundFrame::Pong;
        }
        if text.starts_with('{') {
            if let Ok(announcement) = serde_json::from_str::<ServerKeyAnnouncement>(text) {
                if announcement.kind == SERVER_KEY_TYPE {
                    return InboundFrame::ServerKey(announcement.key);
                }
            }
        }
        InboundFrame::Other(text)
    }
}

/// The relay's per-connection X25519 key, signed by its long-term key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEphemeral {
    pub ephemeral: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedEphemeral {
    pub fn parse(text: &str) -> Result<Self, ProtoError> {
        let mut parts = text.split('|');
        let (Some(key_hex), Some(sig_b64), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ProtoError::MalformedFrame("expected hex|base64".into()));
        };
        if key_hex.is_empty() || sig_b64.is_empty() {
            return Err(ProtoError::MalformedFrame("empty handshake segment".into()));
        }
        Ok(Self {
            ephemeral: hex::decode(key_hex)?,
            signature: STANDARD.decode(sig_b64)?,
        })
    }

    pub fn to_frame(&self) -> String {
        format!("{}|{}", hex::encode(&self.ephemeral), STANDARD.encode(&self.signature))
    }
}
