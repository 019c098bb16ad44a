//! Engine inputs, effects and application-facing events.

use std::time::Duration;

use serde::Serialize;
use sm_proto::ChannelData;

/// Something that happened to the transport or a timer.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    TransportOpened,
    Frame(String),
    TransportError(String),
    TransportClosed(CloseInfo),
    HeartbeatTick,
    ReconnectTimer,
}

/// Work the engine asks its driver to perform, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Replace any existing transport with a new connection to `url`.
    OpenTransport { url: String },
    Send(String),
    CloseTransport,
    StartHeartbeat { interval: Duration },
    StopHeartbeat,
    ScheduleReconnect { delay: Duration, attempt: u32 },
    CancelReconnect,
    Emit(ClientEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloseInfo {
    pub code: Option<u16>,
    pub reason: String,
    pub was_clean: bool,
}

impl CloseInfo {
    pub fn clean(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            reason: reason.into(),
            was_clean: true,
        }
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: reason.into(),
            was_clean: false,
        }
    }
}

/// A peer with an established pairwise key and a known username.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSummary {
    pub peer_id: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelMessage {
    pub peer_id: String,
    pub username: String,
    pub kind: String,
    pub data: ChannelData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Relay session key established and join sent.
    ServerSecured,
    /// Transport closed without a local disconnect.
    ServerClosed(CloseInfo),
    /// Pinned relay key replaced under the rotation policy. Fingerprints;
    /// `previous` is `None` when the stored pin could not be read.
    ServerKeyRotated {
        previous: Option<String>,
        current: String,
    },
    /// Relay presented a key that differs from the pin (or the pin could
    /// not be read) and rotation is disabled. The connection was dropped
    /// and will not be retried.
    TrustRejected {
        pinned: Option<String>,
        presented: String,
    },
    /// A peer's username arrived (first time or changed).
    PeerSecured { peer_id: String, username: String },
    /// Established peers after a roster snapshot.
    PeerList { peers: Vec<PeerSummary> },
    Message(ChannelMessage),
}
