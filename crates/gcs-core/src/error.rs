use thiserror::Error;

/// Errors surfaced across the public boundary of the link manager.
#[derive(Debug, Error)]
pub enum GcsError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("link is disconnected")]
    Disconnected,

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("mission transfer failed: {code}: {message}")]
    MissionTransfer { code: String, message: String },

    #[error("vehicle target unknown: wait for heartbeat")]
    TargetUnknown,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
