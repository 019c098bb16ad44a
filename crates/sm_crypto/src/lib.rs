//! sm_crypto — SprintMate cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - The relay never holds a pairwise key; nothing in here needs it to.
//!
//! # Module layout
//! - `envelope` — AES-256-GCM envelope codec (`nonce|ciphertext|tag`)
//! - `kdf`      — pairwise (HKDF / legacy XOR) and relay-session key derivation
//! - `keys`     — symmetric key newtype + X25519 ephemeral key pairs
//! - `identity` — relay long-term Ed25519 key, signature checks, fingerprints
//! - `hash`     — credential hashing
//! - `error`    — unified error type

pub mod envelope;
pub mod error;
pub mod hash;
pub mod identity;
pub mod kdf;
pub mod keys;

pub use envelope::EnvelopeCodec;
pub use error::CryptoError;
pub use identity::RelayPublicKey;
pub use kdf::KdfMode;
pub use keys::{EphemeralKeyPair, SymmetricKey};
