//! Common error types for cloudlink.

use thiserror::Error;

/// Infrastructure error shared by stores, locks and caches.
///
/// Provider and refresh failures have their own typed errors; this enum
/// only covers the collaborators those components are built on.
#[derive(Debug, Error)]
pub enum Error {
    /// Persistence collaborator failed or is unavailable.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Distributed lock collaborator failed.
    #[error("Lock error: {0}")]
    Lock(String),

    /// Cache collaborator failed.
    #[error("Cache error: {0}")]
    Cache(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A background service is not running.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Compare-and-update lost against a concurrent writer.
    #[error("Version conflict: {0}")]
    Conflict(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
