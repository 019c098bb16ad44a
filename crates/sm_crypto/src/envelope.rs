//! Envelope codec — authenticated encryption of structured payloads.
//!
//! Uses AES-256-GCM. Key size: 32 bytes. Nonce: 12 bytes (random per
//! seal). Tag: 16 bytes, carried detached.
//!
//! Envelope text format (standard base64, `|`-delimited):
//!   b64(nonce) | b64(ciphertext) | b64(tag)
//!
//! The payload is serialised to JSON before sealing; opening deserialises
//! only after the tag has been verified, so callers never see partial or
//! forged plaintext.

use std::collections::{HashMap, VecDeque};

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Key, Nonce, Tag,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use serde::{de::DeserializeOwned, Serialize};
use zeroize::Zeroizing;

use crate::{error::CryptoError, keys::SymmetricKey};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const DELIMITER: char = '|';

/// Default number of imported ciphers kept in the process-local cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Seals and opens envelopes, caching imported ciphers by key fingerprint.
pub struct EnvelopeCodec {
    cache: Mutex<CipherCache>,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::with_cache_capacity(DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(CipherCache::new(capacity.max(1))),
        }
    }

    /// Serialise `payload` and seal it under `key`.
    pub fn seal<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        key: &SymmetricKey,
    ) -> Result<String, CryptoError> {
        let mut buf = Zeroizing::new(serde_json::to_vec(payload)?);
        let cipher = self.cipher(key);

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut buf[..])
            .map_err(|_| CryptoError::AeadEncrypt)?;

        let mut out = String::with_capacity((NONCE_LEN + buf.len() + TAG_LEN) * 4 / 3 + 8);
        out.push_str(&STANDARD.encode(nonce));
        out.push(DELIMITER);
        out.push_str(&STANDARD.encode(buf.as_slice()));
        out.push(DELIMITER);
        out.push_str(&STANDARD.encode(tag));
        Ok(out)
    }

    /// Open an envelope and deserialise its payload.
    pub fn open<T: DeserializeOwned>(
        &self,
        envelope: &str,
        key: &SymmetricKey,
    ) -> Result<T, CryptoError> {
        let plaintext = self.open_bytes(envelope, key)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Open an envelope, returning the authenticated plaintext bytes.
    pub fn open_bytes(
        &self,
        envelope: &str,
        key: &SymmetricKey,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let parts: Vec<&str> = envelope.split(DELIMITER).collect();
        if parts.len() != 3 {
            return Err(CryptoError::MalformedEnvelope(format!(
                "expected 3 segments, got {}",
                parts.len()
            )));
        }

        let nonce = STANDARD.decode(parts[0])?;
        let mut buf = Zeroizing::new(STANDARD.decode(parts[1])?);
        let tag = STANDARD.decode(parts[2])?;

        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::MalformedEnvelope(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            )));
        }
        if tag.len() != TAG_LEN {
            return Err(CryptoError::MalformedEnvelope(format!(
                "tag must be {TAG_LEN} bytes, got {}",
                tag.len()
            )));
        }

        let cipher = self.cipher(key);
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                b"",
                &mut buf[..],
                Tag::from_slice(&tag),
            )
            .map_err(|_| CryptoError::AeadDecrypt)?;

        Ok(buf)
    }

    /// Number of ciphers currently held in the import cache.
    pub fn cached_keys(&self) -> usize {
        self.cache.lock().len()
    }

    fn cipher(&self, key: &SymmetricKey) -> Aes256Gcm {
        self.cache.lock().get_or_import(key)
    }
}

// ── Cipher cache ──────────────────────────────────────────────────────────────

/// FIFO-bounded map from key fingerprint to imported cipher.
///
/// Fingerprints are BLAKE3 digests of the raw key, so the map never holds
/// key bytes in the clear beyond the cipher's own key schedule.
struct CipherCache {
    capacity: usize,
    ciphers: HashMap<[u8; 32], Aes256Gcm>,
    order: VecDeque<[u8; 32]>,
}

impl CipherCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ciphers: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn len(&self) -> usize {
        self.ciphers.len()
    }

    fn get_or_import(&mut self, key: &SymmetricKey) -> Aes256Gcm {
        let fingerprint: [u8; 32] = blake3::hash(key.as_bytes()).into();
        if let Some(cipher) = self.ciphers.get(&fingerprint) {
            return cipher.clone();
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        if self.ciphers.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ciphers.remove(&oldest);
            }
        }
        self.ciphers.insert(fingerprint, cipher.clone());
        self.order.push_back(fingerprint);
        cipher
    }
}
