//! Error types for the replication engine.

use forkdb_storage::StorageError;
use forkdb_sync_protocol::{Direction, ProtocolError};
use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// A storage call failed as a whole.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Revision computation failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A checkpoint could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A replication write was rejected for a reason other than a conflict.
    #[error("{direction} write rejected for document {primary_key:?}: {message}")]
    WriteRejected {
        /// Direction of the failed write.
        direction: Direction,
        /// Primary key of the rejected document.
        primary_key: String,
        /// Rejection reason reported by the storage.
        message: String,
    },

    /// A newer checkpoint was already stored by someone else.
    #[error("checkpoint conflict for {direction} replication")]
    CheckpointConflict {
        /// Direction of the checkpoint.
        direction: Direction,
    },

    /// A replication pass failed while it was awaited.
    #[error("{direction} replication pass failed: {message}")]
    PassFailed {
        /// Direction of the failed pass.
        direction: Direction,
        /// Error message of the underlying failure.
        message: String,
    },

    /// The replication was cancelled.
    #[error("replication cancelled")]
    Cancelled,
}

impl ReplicationError {
    /// Creates a write rejection error.
    pub fn write_rejected(
        direction: Direction,
        primary_key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::WriteRejected {
            direction,
            primary_key: primary_key.into(),
            message: message.into(),
        }
    }

    /// Creates a pass failure from the error that caused it.
    pub fn pass_failed(direction: Direction, cause: &ReplicationError) -> Self {
        Self::PassFailed {
            direction,
            message: cause.to_string(),
        }
    }

    /// Returns true if a later pass may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicationError::Storage(StorageError::Closed) => false,
            ReplicationError::Storage(_) => true,
            ReplicationError::CheckpointConflict { .. } => true,
            ReplicationError::PassFailed { .. } => true,
            _ => false,
        }
    }

    /// Returns true if this error stems from a concurrent writer.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ReplicationError::CheckpointConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(ReplicationError::Storage(StorageError::backend("timeout")).is_retryable());
        assert!(!ReplicationError::Storage(StorageError::Closed).is_retryable());
        assert!(ReplicationError::CheckpointConflict {
            direction: Direction::Up
        }
        .is_retryable());
        assert!(!ReplicationError::Cancelled.is_retryable());
        assert!(!ReplicationError::write_rejected(Direction::Down, "a", "denied").is_retryable());
    }

    #[test]
    fn conflict_classification() {
        assert!(ReplicationError::CheckpointConflict {
            direction: Direction::Down
        }
        .is_conflict());
        assert!(!ReplicationError::Cancelled.is_conflict());
    }

    #[test]
    fn error_display() {
        let err = ReplicationError::write_rejected(Direction::Up, "doc-1", "schema violation");
        assert_eq!(
            err.to_string(),
            "up write rejected for document \"doc-1\": schema violation"
        );

        let failed = ReplicationError::pass_failed(Direction::Down, &err);
        assert!(failed.to_string().starts_with("down replication pass failed"));
        assert!(failed.to_string().contains("schema violation"));
    }
}
