//! Error types for fieldsync-core

use thiserror::Error;

/// Result type alias using fieldsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in fieldsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record, attachment, or conflict not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Network or server failure talking to the remote API
    #[error("Network error: {message}")]
    Network {
        /// Error message.
        message: String,
        /// HTTP status, when the server answered.
        status: Option<u16>,
        /// Whether the request may be retried.
        retryable: bool,
    },

    /// A remote request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,

    /// The server holds a different version than the one being updated
    #[error("Version conflict for item {item_id}")]
    Conflict {
        /// Item that conflicted.
        item_id: String,
    },

    /// Missing or rejected credentials
    #[error("Authentication error: {0}")]
    Auth(String),

    /// No connectivity to the remote API
    #[error("Device is offline")]
    Offline,

    /// A full synchronization is already running
    #[error("A synchronization is already in progress")]
    SyncInProgress,

    /// Synchronization was cancelled
    #[error("Synchronization cancelled")]
    Cancelled,
}

impl Error {
    /// Creates a retryable network error.
    pub fn network_retryable(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Network {
            message: message.into(),
            status,
            retryable: true,
        }
    }

    /// Creates a network error that will not succeed on retry.
    pub fn network_fatal(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Network {
            message: message.into(),
            status,
            retryable: false,
        }
    }

    /// Returns true if the failed operation may succeed when retried.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Network { retryable, .. } => *retryable,
            Self::Timeout => true,
            _ => false,
        }
    }

    /// Returns true for local persistence failures.
    ///
    /// These need operator attention and are never retried automatically.
    pub const fn is_storage(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::LibSql(_) | Self::Io(_) | Self::Serialization(_)
        )
    }

    /// Returns true for errors that abort a whole synchronization run.
    pub const fn is_run_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Offline) || self.is_storage()
    }
}
