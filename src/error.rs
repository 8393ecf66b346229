//! Driftlog Error Types

use thiserror::Error;

use crate::protocol::ReplicationReadError;

/// Result type alias for driftlog operations
pub type Result<T> = std::result::Result<T, Error>;

/// Driftlog error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Lifecycle errors
    #[error("Illegal state: {0}")]
    IllegalState(String),

    // Event log errors
    #[error("Event log error: {0}")]
    EventLog(String),

    #[error("No local event log named {0}")]
    LogNotFound(String),

    #[error("Event log operation timed out after {0:?}")]
    LogTimeout(std::time::Duration),

    // Replication errors
    #[error("Replication read failed: {0}")]
    ReadFailure(#[from] ReplicationReadError),

    #[error("Replication error: {0}")]
    Replication(String),

    // Recovery errors
    #[error("Recovery failed (partial update: {partial_update}): {cause}")]
    Recovery {
        cause: Box<Error>,
        /// True if replication writes may already have occurred; a blind
        /// retry then risks writing causally-out-of-order events.
        partial_update: bool,
    },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Unexpected reply from {address}: {message_type}")]
    UnexpectedReply {
        address: String,
        message_type: &'static str,
    },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap this error as a recovery failure with the given partial-update
    /// indicator.
    pub(crate) fn into_recovery(self, partial_update: bool) -> Error {
        Error::Recovery {
            cause: Box::new(self),
            partial_update,
        }
    }

    /// If this is a recovery error, whether replication writes may already
    /// have occurred.
    pub fn recovery_partial_update(&self) -> Option<bool> {
        match self {
            Error::Recovery { partial_update, .. } => Some(*partial_update),
            _ => None,
        }
    }
}
