use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Cannot determine data directory")]
    NoDataDir,

    #[error("Relay key mismatch for {namespace}: pinned={pinned} presented={presented}")]
    KeyMismatch {
        namespace: String,
        pinned: String,
        presented: String,
    },

    #[error("Pin store for {namespace} unreadable ({tier} tier): {reason}")]
    PinUnreadable {
        namespace: String,
        tier: &'static str,
        reason: String,
    },
}
