//! sm_proto — Wire types for SprintMate
//!
//! Two encryption layers share one JSON shape: an object with an action tag
//! `a` plus short payload fields. The relay layer is sealed with the
//! relay-session key; the peer layer rides inside relay frames as an opaque
//! envelope string sealed with a pairwise key.
//!
//! # Modules
//! - `relay` — relay-layer actions (join, direct, batch, roster snapshot)
//! - `peer`  — peer-layer actions (username update, channel message)
//! - `frame` — handshake-only plaintext frames, heartbeat tokens, limits

pub mod error;
pub mod frame;
pub mod peer;
pub mod relay;

pub use error::ProtoError;
pub use frame::{InboundFrame, SignedEphemeral, MAX_RELAY_ENVELOPE_LEN, PING_TOKEN, PONG_TOKEN};
pub use peer::{ChannelData, PeerMessage};
pub use relay::RelayMessage;
