//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// These are call-level failures. Per-document rejections of a bulk write
/// (optimistic-concurrency conflicts and similar) are reported through
/// [`crate::WriteError`] inside a successful [`crate::BulkWriteResponse`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A revision string could not be parsed.
    #[error("invalid revision: {0:?}")]
    InvalidRevision(String),

    /// A document or checkpoint could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The storage is closed.
    #[error("storage is closed")]
    Closed,

    /// A backend-specific failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Creates a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(StorageError::Closed.to_string(), "storage is closed");

        let err = StorageError::InvalidRevision("abc".into());
        assert!(err.to_string().contains("abc"));

        let err = StorageError::backend("disk full");
        assert_eq!(err.to_string(), "backend error: disk full");
    }
}
