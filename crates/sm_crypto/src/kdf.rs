//! Key derivation functions
//!
//! `derive_peer_key` — pairwise key for two room members. HKDF-SHA256 over
//!   the X25519 secret, salted with the password hash and bound to the room
//!   hash through `info`. Identical room names with different passwords
//!   therefore produce unrelated keys.
//!
//! `relay_session_key` — client↔relay key. The raw ECDH bits truncated to
//!   the AES key length; the relay never learns room credentials, so none
//!   are mixed in.
//!
//! `KdfMode::LegacyXor` — WEAK, NON-STANDARD compatibility mode. It XORs
//!   the secret with the password hash, which is not a KDF: the output
//!   leaks structure of both inputs and offers no domain separation. Only
//!   for interop with peers stuck on the old derivation; never a default.

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{
    error::CryptoError,
    keys::{SymmetricKey, KEY_LEN},
};

/// Byte used to pad short secrets in legacy XOR mode.
const LEGACY_PAD_BYTE: u8 = 0x88;

/// Pairwise key derivation mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KdfMode {
    #[default]
    Hkdf,
    /// See module docs: weak, kept only behind an explicit flag.
    LegacyXor,
}

// ── Pairwise key ──────────────────────────────────────────────────────────────

pub fn derive_peer_key(
    ecdh_secret: &[u8],
    password_hash: &[u8],
    room_hash: &[u8],
    mode: KdfMode,
) -> Result<SymmetricKey, CryptoError> {
    match mode {
        KdfMode::Hkdf => hkdf_peer_key(ecdh_secret, password_hash, room_hash),
        KdfMode::LegacyXor => legacy_xor_key(ecdh_secret, password_hash),
    }
}

/// HKDF-SHA256(ikm = secret, salt = password hash, info = room hash).
pub fn hkdf_peer_key(
    ecdh_secret: &[u8],
    password_hash: &[u8],
    room_hash: &[u8],
) -> Result<SymmetricKey, CryptoError> {
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hkdf_expand(ecdh_secret, Some(password_hash), room_hash, &mut okm[..])?;
    Ok(SymmetricKey::from_bytes(*okm))
}

/// Secret (padded with 0x88 / truncated to 32 bytes) XOR password hash.
pub fn legacy_xor_key(ecdh_secret: &[u8], password_hash: &[u8]) -> Result<SymmetricKey, CryptoError> {
    if password_hash.len() < KEY_LEN {
        return Err(CryptoError::KeyDerivation(format!(
            "legacy XOR needs a {KEY_LEN}-byte password hash, got {}",
            password_hash.len()
        )));
    }
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    for (i, byte) in out.iter_mut().enumerate() {
        let s = ecdh_secret.get(i).copied().unwrap_or(LEGACY_PAD_BYTE);
        *byte = s ^ password_hash[i];
    }
    Ok(SymmetricKey::from_bytes(*out))
}

// ── Relay-session key ─────────────────────────────────────────────────────────

/// Truncate raw ECDH output to the symmetric key length.
pub fn relay_session_key(shared_bits: &[u8]) -> Result<SymmetricKey, CryptoError> {
    if shared_bits.len() < KEY_LEN {
        return Err(CryptoError::InvalidKey(format!(
            "ECDH output too short for session key: {} bytes",
            shared_bits.len()
        )));
    }
    SymmetricKey::from_slice(&shared_bits[..KEY_LEN])
}

// ── HKDF-SHA256 ───────────────────────────────────────────────────────────────

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
///
/// `salt` may be `None` (HKDF will use a zeroed salt).
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}
