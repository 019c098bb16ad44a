//! Trust-on-first-use pinning of the relay's long-term key.
//!
//! State: `unset → pinned`. Only an explicit rotation policy moves an
//! existing pin. Lookups consult the durable tier, then the session tier,
//! then the in-memory copy; writes go to the first tier that accepts them.
//! A tier that cannot be read counts as holding an unknown pin, never as
//! an empty one.

use sm_crypto::RelayPublicKey;
use tracing::{debug, info, warn};

use crate::{error::StoreError, tiers::PinStore};

const NAMESPACE_PREFIX: &str = "sprintmate_server_key";

/// Storage key for the pin belonging to one relay address.
pub fn namespace_for_host(host: Option<&str>) -> String {
    match host {
        Some(h) if !h.is_empty() => format!("{NAMESPACE_PREFIX}:{h}"),
        _ => format!("{NAMESPACE_PREFIX}:default"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    /// No pin existed; the presented key is now pinned.
    FirstUse,
    /// The presented key equals the pin.
    Matched,
    /// The pin was replaced under the rotation policy. Carries the
    /// previous key (base64), or `None` when the stored pin was unreadable.
    Rotated { previous: Option<String> },
}

pub struct TrustAnchor {
    namespace: String,
    tiers: Vec<Box<dyn PinStore>>,
    memory: Option<String>,
    allow_rotation: bool,
}

impl TrustAnchor {
    pub fn new(namespace: impl Into<String>, allow_rotation: bool) -> Self {
        Self {
            namespace: namespace.into(),
            tiers: Vec::new(),
            memory: None,
            allow_rotation,
        }
    }

    /// Append a storage tier. Tiers are consulted in insertion order.
    pub fn with_tier(mut self, store: impl PinStore + 'static) -> Self {
        self.tiers.push(Box::new(store));
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn allow_rotation(&self) -> bool {
        self.allow_rotation
    }

    /// Currently pinned key (base64), if any. An unreadable tier yields
    /// `None` here; use [`TrustAnchor::lookup`] to tell the two apart.
    pub fn pinned(&self) -> Option<String> {
        self.lookup().ok().flatten()
    }

    /// Resolve the pin across tiers. The first tier holding a pin wins.
    /// With no pin anywhere, a tier that failed to load makes the result
    /// an error rather than `Ok(None)`.
    pub fn lookup(&self) -> Result<Option<String>, StoreError> {
        let mut unreadable = None;
        for tier in &self.tiers {
            match tier.load(&self.namespace) {
                Ok(Some(key)) => return Ok(Some(key)),
                Ok(None) => {}
                Err(err) => {
                    warn!(op = "pin_load", tier = tier.tier(), error = %err, "pin tier unreadable");
                    unreadable.get_or_insert((tier.tier(), err.to_string()));
                }
            }
        }
        match (&self.memory, unreadable) {
            (Some(key), _) => Ok(Some(key.clone())),
            (None, Some((tier, reason))) => Err(StoreError::PinUnreadable {
                namespace: self.namespace.clone(),
                tier,
                reason,
            }),
            (None, None) => Ok(None),
        }
    }

    /// Pinned key parsed as a verifying key. An unparseable pin is treated
    /// as absent for verification purposes but still blocks TOFU.
    pub fn pinned_key(&self) -> Option<RelayPublicKey> {
        self.pinned().and_then(|k| RelayPublicKey::from_b64(&k).ok())
    }

    /// Apply the pinning policy to a key announced by the relay.
    pub fn check(&mut self, presented: &RelayPublicKey) -> Result<TrustDecision, StoreError> {
        let presented_b64 = presented.to_b64();

        let pinned = match self.lookup() {
            Ok(Some(pinned)) => pinned,
            Ok(None) => {
                info!(
                    op = "trust_check",
                    namespace = %self.namespace,
                    fingerprint = %presented.fingerprint(),
                    "pinning relay key on first use"
                );
                self.persist(&presented_b64);
                return Ok(TrustDecision::FirstUse);
            }
            Err(err) => {
                warn!(
                    op = "trust_check",
                    namespace = %self.namespace,
                    presented = %presented.fingerprint(),
                    rotation_allowed = self.allow_rotation,
                    error = %err,
                    "stored pin unreadable; treating as mismatch"
                );
                if !self.allow_rotation {
                    return Err(err);
                }
                self.remove_from_tiers();
                self.persist(&presented_b64);
                return Ok(TrustDecision::Rotated { previous: None });
            }
        };

        if pinned.trim() == presented_b64 {
            debug!(op = "trust_check", namespace = %self.namespace, "relay key matches pin");
            self.memory = Some(presented_b64);
            return Ok(TrustDecision::Matched);
        }

        warn!(
            op = "trust_check",
            namespace = %self.namespace,
            pinned = %fingerprint_b64(&pinned),
            presented = %presented.fingerprint(),
            rotation_allowed = self.allow_rotation,
            "relay key mismatch"
        );

        if !self.allow_rotation {
            return Err(StoreError::KeyMismatch {
                namespace: self.namespace.clone(),
                pinned: fingerprint_b64(&pinned),
                presented: presented.fingerprint(),
            });
        }

        self.remove_from_tiers();
        self.persist(&presented_b64);
        Ok(TrustDecision::Rotated {
            previous: Some(pinned),
        })
    }

    /// Forget the pin in every tier and in memory.
    pub fn clear(&mut self) {
        self.remove_from_tiers();
        self.memory = None;
    }

    fn remove_from_tiers(&self) {
        for tier in &self.tiers {
            if let Err(err) = tier.remove(&self.namespace) {
                warn!(op = "pin_remove", tier = tier.tier(), error = %err, "could not remove pin");
            }
        }
    }

    fn persist(&mut self, key_b64: &str) {
        self.memory = Some(key_b64.to_string());
        for tier in &self.tiers {
            match tier.save(&self.namespace, key_b64) {
                Ok(()) => {
                    debug!(op = "pin_persist", tier = tier.tier(), "pin stored");
                    return;
                }
                Err(err) => {
                    warn!(op = "pin_persist", tier = tier.tier(), error = %err, "pin tier rejected write");
                }
            }
        }
        warn!(op = "pin_persist", namespace = %self.namespace, "pin kept in memory only");
    }
}

fn fingerprint_b64(key_b64: &str) -> String {
    RelayPublicKey::from_b64(key_b64)
        .map(|k| k.fingerprint())
        .unwrap_or_else(|_| "<unparseable>".to_string())
}
