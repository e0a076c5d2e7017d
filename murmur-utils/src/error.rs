//! Error types for murmur
//!
//! Provides a unified error type used across all murmur crates.

use std::path::PathBuf;

/// Main error type for murmur operations
#[derive(Debug, thiserror::Error)]
pub enum MurmurError {
    // === IO Errors ===

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // === Session Errors ===

    #[error("Not connected to a homeserver")]
    NotConnected,

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    // === Room Errors ===

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Only one listener is allowed per room: {0}")]
    ListenerConflict(String),

    /// A history load found no backward listener; see `HistoryPage::require_loaded`
    #[error("No active listener for room: {0}")]
    NoActiveListener(String),

    // === Transport Errors ===

    #[error("Protocol client error: {0}")]
    Transport(String),

    #[error("Failed to fetch messages: {0}")]
    FetchFailed(String),

    #[error("Search failed: {0}")]
    SearchFailed(String),

    // === Search Usage Errors ===

    #[error("Search context already initialized with term '{0}'")]
    SearchTermAlreadySet(String),

    #[error("Search has not been started on this context")]
    SearchNotStarted,

    // === Configuration Errors ===

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    // === Internal Errors ===

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MurmurError {
    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Re-label a transport failure as a failed fetch.
    ///
    /// Domain errors reported by the protocol client pass through unchanged.
    pub fn into_fetch_failed(self) -> Self {
        match self {
            Self::Transport(msg) => Self::FetchFailed(msg),
            other => other,
        }
    }

    /// Re-label a transport failure as a failed search
    pub fn into_search_failed(self) -> Self {
        match self {
            Self::Transport(msg) => Self::SearchFailed(msg),
            other => other,
        }
    }

    /// Re-label a transport failure as an authentication failure
    pub fn into_auth(self) -> Self {
        match self {
            Self::Transport(msg) => Self::Auth(msg),
            other => other,
        }
    }

    /// Re-label a transport failure as a connection failure
    pub fn into_connect(self) -> Self {
        match self {
            Self::Transport(msg) => Self::Connect(msg),
            other => other,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::FetchFailed(_) | Self::SearchFailed(_) | Self::Connect(_)
        )
    }

    /// Check if this error means the session is not connected
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected)
    }
}

impl From<serde_json::Error> for MurmurError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}

/// Result type alias using MurmurError
pub type Result<T> = std::result::Result<T, MurmurError>;
