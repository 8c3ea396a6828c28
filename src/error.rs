//! Error types for quota-guard.

use std::time::Duration;

use thiserror::Error;

/// Failures talking to the shared counter store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Could not establish a connection
    #[error("Connection error: {0}")]
    Connection(String),

    /// The store rejected or failed a command
    #[error("Command failed: {0}")]
    Command(#[from] redis::RedisError),

    /// The store did not answer within the command timeout
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with something the protocol does not allow
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
}

/// Main error type for quota-guard operations.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// A store operation failed; `context` names the operation
    #[error("{context}: {source}")]
    Store {
        context: &'static str,
        #[source]
        source: StoreError,
    },

    /// Identities must be non-empty
    #[error("Identity must not be empty")]
    InvalidIdentity,

    /// Limits must be positive
    #[error("Invalid limit: {0}")]
    InvalidLimit(u64),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl QuotaError {
    /// Wrap a store failure with the name of the operation that hit it.
    pub fn store(context: &'static str, source: StoreError) -> Self {
        QuotaError::Store { context, source }
    }

    /// True when the error came from the counter store.
    pub fn is_store(&self) -> bool {
        matches!(self, QuotaError::Store { .. })
    }
}

/// Result type alias for quota-guard operations.
pub type Result<T> = std::result::Result<T, QuotaError>;

/// Result type alias for raw store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display_carries_context() {
        let err = QuotaError::store("rate limit check failed", StoreError::Timeout(Duration::from_millis(30)));
        assert!(err.is_store());
        assert_eq!(err.to_string(), "rate limit check failed: Command timed out after 30ms");
    }

    #[test]
    fn test_non_store_errors() {
        assert!(!QuotaError::InvalidIdentity.is_store());
        assert_eq!(QuotaError::InvalidLimit(0).to_string(), "Invalid limit: 0");
    }
}
