//! Hash utilities
//!
//! - SHA-256 of room names and passwords (credentials never leave the
//!   client unhashed)
//! - BLAKE3 fingerprints for displaying / logging public keys

use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Lowercase hex SHA-256, the form in which room and password hashes travel.
pub fn sha256_hex(data: &str) -> String {
    hex::encode(sha256(data.as_bytes()))
}

/// Human-readable fingerprint: BLAKE3 of the key, truncated to 20 bytes,
/// hex-encoded in groups of 4.
///
/// Example: "a1b2 c3d4 e5f6 7890 abcd ef01 2345 6789 0abc def0"
pub fn fingerprint(key: &[u8]) -> String {
    let hash = blake3::hash(key);
    let hex = hex::encode(&hash.as_bytes()[..20]);
    hex.as_bytes()
        .chunks(4)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
