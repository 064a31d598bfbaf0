//! Error types for harbor-core

use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// No workspace with this id
    #[error("workspace not found: {0}")]
    NotFound(String),

    /// The instance executable could not be resolved
    #[error("unable to resolve instance binary {name}: {reason}")]
    BinaryUnresolved {
        /// Requested executable
        name: String,
        /// Why resolution failed
        reason: String,
    },

    /// Launch or readiness failure; the message is the runtime's own
    #[error(transparent)]
    Launch(#[from] harbor_process::Error),

    /// The workspace was deleted before it became ready
    #[error("workspace {0} was deleted while starting")]
    Cancelled(String),

    /// Internal error (runtime handle, HTTP client, etc.)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
