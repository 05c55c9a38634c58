//! Error types for the sync client.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while connecting, subscribing, or synchronizing.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The relay credentials endpoint was unreachable or returned a malformed body.
    #[error("config error: {0}")]
    Config(String),

    /// The relay reported a transport-level failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// A connection attempt did not reach `connected` within the allotted time.
    #[error("connection attempt timed out after {0:?}")]
    ConnectionTimeout(Duration),

    /// A local rate-limit guard rejected the action before any network call.
    #[error("rate limit exceeded for `{action}`")]
    RateLimitExceeded {
        /// Action key whose window is exhausted.
        action: String,
    },

    /// A relay subscribe/unsubscribe call failed.
    #[error("channel error on `{channel}`: {message}")]
    Channel {
        /// Channel the operation targeted.
        channel: String,
        /// Error reported by the relay.
        message: String,
    },

    /// An inbound event or poll payload could not be applied.
    #[error("dropped malformed update: {0}")]
    SyncApply(String),

    /// A game API call failed. `status` is `None` when no response was received.
    #[error("http request failed: {message}")]
    Http {
        /// HTTP status code, if a response arrived.
        status: Option<u16>,
        /// Human-readable failure description.
        message: String,
    },

    /// Failed to serialize or deserialize a JSON payload.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The operation requires a joined game.
    #[error("not in a game")]
    NotInGame,

    /// A newer join or leave replaced the request before it completed.
    #[error("superseded by a newer request")]
    Superseded,

    /// The sync loop has exited; the client handle is no longer usable.
    #[error("sync client has shut down")]
    Shutdown,
}

impl SyncError {
    /// Returns `true` for failures that end a connection attempt and feed backoff.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Connection(_) | Self::ConnectionTimeout(_)
        )
    }
}

/// A specialized [`Result`] type for sync client operations.
pub type Result<T> = std::result::Result<T, SyncError>;
