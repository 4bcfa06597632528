//! Error types for namespace cache operations.
//!
//! Absence is not an error here: reads report a missing entry as `Ok(None)`
//! and metadata reads with metadata turned off report
//! [`MetaRead::Disabled`](crate::MetaRead::Disabled).

use thiserror::Error;

/// Errors that can occur during cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backend store could not be reached or rejected the call.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A caller-supplied path is malformed (empty, or has empty segments).
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// A value cannot be flattened into leaf entries.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Expected blob version does not match the current version.
    #[error("version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },

    /// The backend does not implement an optional operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Configuration failed validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Database error from SQLx. Connection-level failures become
    /// [`BackendUnavailable`](CacheError::BackendUnavailable) instead.
    #[error("database error: {0}")]
    DatabaseError(#[source] sqlx::Error),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::VersionConflict { .. } | CacheError::BackendUnavailable(_)
        )
    }

    /// Returns true if the failure originated at the backend boundary.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            CacheError::BackendUnavailable(_) | CacheError::DatabaseError(_)
        )
    }
}

impl From<sqlx::Error> for CacheError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => CacheError::BackendUnavailable(err.to_string()),
            other => CacheError::DatabaseError(other),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}
