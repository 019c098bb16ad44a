//! Local identity for one room.
//!
//! Room name and password are hashed immediately and never kept in the
//! clear. The relay only ever sees the room hash; the password hash stays
//! on the client as HKDF salt.

use sm_crypto::hash::sha256_hex;
use sm_proto::peer::normalize_username;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::ClientError;

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    username: String,
    room_hash: String,
    password_hash: String,
}

impl Credentials {
    pub fn new(username: &str, room: &str, password: &str) -> Result<Self, ClientError> {
        let username = normalize_username(username).ok_or(ClientError::EmptyUsername)?;
        Ok(Self {
            username,
            room_hash: sha256_hex(room),
            password_hash: sha256_hex(password),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn set_username(&mut self, username: String) {
        self.username = username;
    }

    /// Hex SHA-256 of the room name; the only room identifier sent to the relay.
    pub fn room_hash(&self) -> &str {
        &self.room_hash
    }

    pub fn room_hash_bytes(&self) -> Vec<u8> {
        // Produced by sha256_hex, always valid hex.
        hex::decode(&self.room_hash).unwrap_or_default()
    }

    pub fn password_hash_bytes(&self) -> Vec<u8> {
        hex::decode(&self.password_hash).unwrap_or_default()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("room_hash", &self.room_hash)
            .finish_non_exhaustive()
    }
}
