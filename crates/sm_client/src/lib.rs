//! sm_client — SprintMate client
//!
//! A sans-IO [`Engine`] holds the connection state machine, the room roster
//! and the peer handshake. [`Client`] runs an engine on tokio with a real
//! WebSocket. Tests drive the engine directly with scripted frames.
//!
//! # Module layout
//! - `engine`      — state machine, relay handshake, message routing
//! - `driver`      — tokio / tungstenite runtime and command handle
//! - `roster`      — per-peer key pairs, pairwise keys and usernames
//! - `config`      — layered client configuration
//! - `credentials` — username plus hashed room and password
//! - `backoff`     — reconnect delay policy
//! - `events`      — engine inputs, effects and application events

pub mod backoff;
pub mod config;
pub mod credentials;
pub mod driver;
pub mod engine;
pub mod error;
pub mod events;
pub mod roster;

pub use config::ClientConfig;
pub use driver::{Client, ClientHandle};
pub use engine::{ConnectionState, Engine};
pub use error::{ClientError, SendError};
pub use events::{ChannelMessage, ClientEvent, CloseInfo, Effect, Input, PeerSummary};
pub use sm_proto::ChannelData;
