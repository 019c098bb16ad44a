//! Client configuration.
//!
//! Layering, lowest to highest precedence: built-in defaults, an optional
//! JSON file, `SM_*` environment variables, then whatever the embedding
//! application (usually the CLI) sets on the struct directly.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use sm_crypto::{KdfMode, RelayPublicKey};
use sm_store::{namespace_for_host, FilePinStore, SessionPinStore, TrustAnchor};
use tracing::{debug, warn};
use url::Url;

use crate::{backoff::ReconnectPolicy, error::ClientError};

pub const ENV_RELAY_URL: &str = "SM_RELAY_URL";
pub const ENV_RELAY_PUBLIC_KEY: &str = "SM_RELAY_PUBLIC_KEY";
pub const ENV_DEBUG: &str = "SM_DEBUG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `ws://` or `wss://` address of the relay.
    pub relay_url: String,
    /// Bootstrap relay key (base64 Ed25519). Used to verify the signed
    /// reply until the relay announces a key that passes pinning.
    pub relay_public_key: Option<String>,
    pub reconnect_delay_ms: u64,
    pub reconnect_cap_ms: u64,
    pub reconnect_jitter_ms: u64,
    pub ping_interval_ms: u64,
    /// Close the transport after this many heartbeat ticks without any
    /// inbound frame. `0` disables the check.
    pub heartbeat_miss_limit: u32,
    pub allow_server_key_rotation: bool,
    /// Derive pairwise keys with the XOR scheme instead of HKDF. Only for
    /// talking to peers that predate HKDF.
    pub legacy_xor_kdf: bool,
    pub debug: bool,
    /// Durable pin file. Defaults to the per-user data directory.
    pub pin_file: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: String::new(),
            relay_public_key: None,
            reconnect_delay_ms: 3000,
            reconnect_cap_ms: 30_000,
            reconnect_jitter_ms: 500,
            ping_interval_ms: 2000,
            heartbeat_miss_limit: 0,
            allow_server_key_rotation: true,
            legacy_xor_kdf: false,
            debug: false,
            pin_file: None,
        }
    }
}

impl ClientConfig {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            ..Self::default()
        }
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ClientError> {
        let path = path.into();
        let raw = std::fs::read_to_string(&path)?;
        let config: ClientConfig = serde_json::from_str(&raw)?;
        debug!(op = "config_load", path = %path.display(), "loaded client config");
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Overlay values from an environment lookup.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_RELAY_URL).filter(|v| !v.trim().is_empty()) {
            self.relay_url = url.trim().to_string();
        }
        if let Some(key) = lookup(ENV_RELAY_PUBLIC_KEY).filter(|v| !v.trim().is_empty()) {
            self.relay_public_key = Some(key.trim().to_string());
        }
        if let Some(flag) = lookup(ENV_DEBUG) {
            self.debug = matches!(flag.trim(), "1" | "true" | "yes" | "on");
        }
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        let url = self.parsed_url()?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ClientError::Config(format!(
                "relay_url must use ws:// or wss://, got {}://",
                url.scheme()
            )));
        }
        if self.ping_interval_ms == 0 {
            return Err(ClientError::Config("ping_interval_ms must be non-zero".into()));
        }
        if self.reconnect_delay_ms == 0 || self.reconnect_cap_ms < self.reconnect_delay_ms {
            return Err(ClientError::Config(
                "reconnect delay must be non-zero and not above the cap".into(),
            ));
        }
        if let Some(key) = &self.relay_public_key {
            RelayPublicKey::from_b64(key)
                .map_err(|e| ClientError::Config(format!("relay_public_key: {e}")))?;
        }
        Ok(())
    }

    fn parsed_url(&self) -> Result<Url, ClientError> {
        Url::parse(&self.relay_url)
            .map_err(|e| ClientError::Config(format!("relay_url {:?}: {e}", self.relay_url)))
    }

    /// `host[:port]` of the relay, used to scope pins.
    pub fn relay_host(&self) -> Option<String> {
        let url = self.parsed_url().ok()?;
        let host = url.host_str()?;
        Some(match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    }

    pub fn bootstrap_key(&self) -> Option<RelayPublicKey> {
        let key = self.relay_public_key.as_deref()?;
        match RelayPublicKey::from_b64(key) {
            Ok(k) => Some(k),
            Err(err) => {
                warn!(op = "config", error = %err, "ignoring unparseable bootstrap relay key");
                None
            }
        }
    }

    pub fn kdf_mode(&self) -> KdfMode {
        if self.legacy_xor_kdf {
            KdfMode::LegacyXor
        } else {
            KdfMode::Hkdf
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(self.reconnect_delay_ms),
            cap: Duration::from_millis(self.reconnect_cap_ms),
            max_jitter: Duration::from_millis(self.reconnect_jitter_ms),
        }
    }

    /// Pin store for this relay: durable file, then process-wide session
    /// tier, then memory.
    pub fn trust_anchor(&self) -> TrustAnchor {
        let namespace = namespace_for_host(self.relay_host().as_deref());
        let mut anchor = TrustAnchor::new(namespace, self.allow_server_key_rotation);
        let durable = match &self.pin_file {
            Some(path) => Some(FilePinStore::new(path)),
            None => match FilePinStore::open_default() {
                Ok(store) => Some(store),
                Err(err) => {
                    warn!(op = "config", error = %err, "no durable pin store; pins last for this process only");
                    None
                }
            },
        };
        if let Some(store) = durable {
            anchor = anchor.with_tier(store);
        }
        anchor.with_tier(SessionPinStore::process())
    }
}
