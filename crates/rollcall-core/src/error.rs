//! Error types for rollcall-core

use thiserror::Error;

/// Result type alias using rollcall-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in rollcall-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// The durable store could not be reached; callers retry later
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A remote attempt failed because of connectivity
    #[error("Transient network failure: {0}")]
    TransientNetwork(String),

    /// A change-record can never be delivered without human attention
    #[error("Permanent action failure: {0}")]
    PermanentAction(String),

    /// A write was attempted without an active tenant
    #[error("No active tenant")]
    TenantMissing,

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure may resolve on its own (storage recovering, network returning).
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::TransientNetwork(_))
    }
}

impl From<libsql::Error> for Error {
    fn from(error: libsql::Error) -> Self {
        Self::StorageUnavailable(error.to_string())
    }
}
