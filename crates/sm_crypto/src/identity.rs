//! Relay long-term identity key.
//!
//! The relay owns one Ed25519 signing key. Its public half is announced at
//! session start (base64 on the wire), pinned by the client, and used to
//! verify the signature over every per-connection relay ephemeral X25519
//! key. A valid signature is the only thing that lets the client derive a
//! relay-session key.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signature, VerifyingKey};

use crate::{error::CryptoError, hash};

/// Ed25519 verifying key of the relay.
#[derive(Clone, PartialEq, Eq)]
pub struct RelayPublicKey(VerifyingKey);

impl RelayPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "Relay public key must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        let key = VerifyingKey::from_bytes(&arr).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self(key))
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD.decode(s.trim())?;
        Self::from_bytes(&bytes)
    }

    pub fn to_b64(&self) -> String {
        STANDARD.encode(self.0.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn fingerprint(&self) -> String {
        hash::fingerprint(self.0.as_bytes())
    }

    /// Verify the relay's signature over its raw ephemeral public key.
    pub fn verify_ephemeral(&self, ephemeral: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Bad signature length".into()))?;
        let sig = Signature::from_bytes(&sig_bytes);
        self.0
            .verify_strict(ephemeral, &sig)
            .map_err(|_| CryptoError::SignatureVerification)
    }
}

impl fmt::Debug for RelayPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RelayPublicKey").field(&self.fingerprint()).finish()
    }
}
