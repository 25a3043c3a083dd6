//! Sync layer error types

use thiserror::Error;

/// Error type for the channel and queue machinery.
#[derive(Debug, Error)]
pub enum SyncError {
    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Invalid channel URL
    #[error("invalid channel URL: {0}")]
    InvalidUrl(String),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Durable queue storage error
    #[error("queue storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Timed-out connection open or heartbeat
    #[error("timeout: {0}")]
    Timeout(String),

    /// Operation requires an open channel
    #[error("not connected")]
    NotConnected,

    /// Server rejected the credential; reconnection is suppressed
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// Internal invariant failure
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias for the sync layer.
pub type Result<T> = std::result::Result<T, SyncError>;
