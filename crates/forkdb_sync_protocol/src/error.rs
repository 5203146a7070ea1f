//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised by the revision codec and protocol types.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Document content could not be serialized for hashing.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An unknown replication direction name.
    #[error("invalid direction: {0:?}")]
    InvalidDirection(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::InvalidDirection("sideways".into());
        assert_eq!(err.to_string(), "invalid direction: \"sideways\"");
    }
}
