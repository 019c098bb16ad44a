//! Key material newtypes.
//!
//! `SymmetricKey` is the 32-byte AES-256-GCM key used for both the
//! relay-session layer and the pairwise layer. `EphemeralKeyPair` is an
//! X25519 key pair generated per connection (relay-facing) or per peer
//! (pairwise); its secret half stays in memory until the counterpart's
//! public key arrives, then is dropped with the session.

use std::fmt;

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

/// Symmetric key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// 32-byte symmetric key. Zeroized on drop, redacted in `Debug`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "Symmetric key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        // Constant-time comparison
        let mut diff = 0u8;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }
}

impl Eq for SymmetricKey {}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

// ── X25519 ephemeral key pair ─────────────────────────────────────────────────

pub struct EphemeralKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Hex encoding used on the wire for every ephemeral public key.
    pub fn public_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }

    /// Raw X25519 shared secret with a peer key given as raw bytes.
    ///
    /// Non-contributory results (low-order peer points) are rejected so a
    /// hostile counterpart cannot force an all-zero secret.
    pub fn diffie_hellman(&self, peer_public: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let peer = parse_public(peer_public)?;
        let shared = self.secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey("Non-contributory X25519 point".into()));
        }
        Ok(Zeroizing::new(*shared.as_bytes()))
    }

    /// Same as [`diffie_hellman`](Self::diffie_hellman) for a hex-encoded key.
    pub fn diffie_hellman_hex(&self, peer_hex: &str) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let bytes = hex::decode(peer_hex.trim())?;
        self.diffie_hellman(&bytes)
    }
}

impl fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &self.public_hex())
            .finish_non_exhaustive()
    }
}

fn parse_public(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
    let arr: [u8; 32] = bytes.try_into().map_err(|_| {
        CryptoError::InvalidKey(format!("X25519 public key must be 32 bytes, got {}", bytes.len()))
    })?;
    Ok(PublicKey::from(arr))
}
