//! Peer-layer messages — sealed with a pairwise key, opaque to the relay.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtoError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "a")]
pub enum PeerMessage {
    /// Announce or change the sender's display name. Also completes the
    /// pairwise handshake: it is the first message sent under a new key.
    #[serde(rename = "u")]
    Username {
        #[serde(rename = "p")]
        name: String,
    },

    /// Application message with a free-form type tag.
    #[serde(rename = "m")]
    Channel {
        #[serde(rename = "t")]
        kind: String,
        #[serde(rename = "d")]
        data: ChannelData,
    },
}

/// Channel message body: a string or a JSON object. Arrays, numbers and
/// null are not accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelData {
    Text(String),
    Structured(Map<String, Value>),
}

impl From<&str> for ChannelData {
    fn from(value: &str) -> Self {
        ChannelData::Text(value.to_string())
    }
}

impl From<String> for ChannelData {
    fn from(value: String) -> Self {
        ChannelData::Text(value)
    }
}

impl PeerMessage {
    /// Parse and validate a decrypted peer payload.
    pub fn from_value(value: Value) -> Result<Self, ProtoError> {
        let msg: PeerMessage = serde_json::from_value(value)?;
        match &msg {
            PeerMessage::Username { name } => {
                if normalize_username(name).is_none() {
                    return Err(ProtoError::InvalidField("p"));
                }
            }
            PeerMessage::Channel { kind, data } => {
                if kind.is_empty() {
                    return Err(ProtoError::InvalidField("t"));
                }
                if matches!(data, ChannelData::Text(text) if text.is_empty()) {
                    return Err(ProtoError::InvalidField("d"));
                }
            }
        }
        Ok(msg)
    }
}

/// Trim a display name; `None` when nothing but whitespace remains.
pub fn normalize_username(name: &str) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
