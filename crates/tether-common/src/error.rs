//! Common error types for Tether components.

use thiserror::Error;

/// Result alias used throughout Tether
pub type Result<T, E = TetherError> = std::result::Result<T, E>;

/// Errors surfaced by the coordination client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TetherError {
    /// No reachable endpoint, or the session was lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// Deadline exceeded on a bounded call
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The caller's cancellation signal fired
    #[error("Operation cancelled")]
    Cancelled,

    /// The connection handle has been closed
    #[error("Connection handle is closed")]
    Closed,

    /// Rejected locally before any network call
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown or expired lease
    #[error("Not found: {0}")]
    NotFound(String),

    /// Any other failure reported by the store
    #[error("Store error: {0}")]
    Store(String),

    /// Payload could not be serialized
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Payload could not be deserialized
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TetherError {
    /// Returns true if this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(TetherError::Connection("down".into()).is_retryable());
        assert!(TetherError::Timeout("5s".into()).is_retryable());
        assert!(!TetherError::NotFound("lease".into()).is_retryable());
        assert!(!TetherError::InvalidArgument("ttl".into()).is_retryable());
        assert!(!TetherError::Closed.is_retryable());
        assert!(!TetherError::Cancelled.is_retryable());
    }
}
