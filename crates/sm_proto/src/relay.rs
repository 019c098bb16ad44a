//! Relay-layer messages — what the relay decrypts and routes.
//!
//! The relay sees peer ids and opaque pairwise envelopes, never room names,
//! passwords, usernames or message bodies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtoError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "a")]
pub enum RelayMessage {
    /// Client → relay: enter the room identified by `room_hash`.
    #[serde(rename = "j")]
    Join {
        #[serde(rename = "p")]
        room_hash: String,
    },

    /// One peer-layer payload addressed to (outbound) or received from
    /// (inbound) `peer_id`. During the peer handshake the payload is a bare
    /// hex public key instead of an envelope.
    #[serde(rename = "c")]
    Direct {
        #[serde(rename = "p")]
        payload: String,
        #[serde(rename = "c")]
        peer_id: String,
    },

    /// Client → relay: fan-out, one payload per peer id.
    #[serde(rename = "w")]
    Batch {
        #[serde(rename = "p")]
        payloads: BTreeMap<String, String>,
    },

    /// Relay → client: authoritative list of the other members of the room.
    #[serde(rename = "l")]
    Roster {
        #[serde(rename = "p")]
        peers: Vec<String>,
    },
}

impl RelayMessage {
    /// Interpret a decrypted relay payload. Unknown actions or missing
    /// fields are errors; callers drop the frame.
    pub fn from_value(value: Value) -> Result<Self, ProtoError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn action(&self) -> &'static str {
        match self {
            RelayMessage::Join { .. } => "j",
            RelayMessage::Direct { .. } => "c",
            RelayMessage::Batch { .. } => "w",
            RelayMessage::Roster { .. } => "l",
        }
    }
}
