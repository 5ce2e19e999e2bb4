//! Error handling for the realtime synchronization layer
//!
//! All operations in this crate return [`Result`], an alias over
//! [`SyncError`]. The taxonomy mirrors how failures are surfaced to the
//! application:
//!
//! - **Validation** errors are rejected before any network call and are
//!   surfaced synchronously to the caller.
//! - **Transport** and **Auth** errors are surfaced exactly once; this
//!   layer never retries on its own — the user re-triggers the action.
//! - **ChannelClosed** marks a lapsed subscription or presence channel.
//!   Presence loss is never shown to the user; the typing timeout and the
//!   reconnect resubscription absorb it.
//!
//! JSON and I/O errors convert automatically through `From`.

use thiserror::Error;

/// Result type for synchronization operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur in the synchronization layer
#[derive(Error, Debug)]
pub enum SyncError {
    /// I/O error (sockets, config files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Input rejected before any network call
    #[error("Validation error: {0}")]
    Validation(String),

    /// A read or write could not be committed (network failure)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The backend rejected the caller's identity
    #[error("Auth error: {0}")]
    Auth(String),

    /// Referenced record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A subscription or presence channel has lapsed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl SyncError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid-state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}
