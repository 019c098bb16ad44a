use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Unrecognised or malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid field: {0}")]
    InvalidField(&'static str),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
