use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Credentials not set, call set_credentials first")]
    MissingCredentials,

    #[error("Username must not be empty")]
    EmptyUsername,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Client task has stopped")]
    Stopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

/// Why an outbound send was refused. Nothing reaches the wire when one of
/// these is returned.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("Relay session not secured")]
    NotSecured,

    #[error("Credentials not set")]
    MissingCredentials,

    #[error("Username must not be empty")]
    EmptyUsername,

    #[error("Message type must not be empty")]
    EmptyType,

    #[error("Relay envelope of {len} bytes exceeds the {max} byte ceiling")]
    TooLarge { len: usize, max: usize },

    #[error("Transport is not open")]
    NotConnected,

    #[error("Crypto error: {0}")]
    Crypto(#[from] sm_crypto::CryptoError),

    #[error("Client task has stopped")]
    Stopped,
}
