//! Error types for the ingester

use crate::Timestamp;
use thiserror::Error;

/// Result type alias for ingester operations
pub type Result<T> = std::result::Result<T, IngesterError>;

/// Ingester error types
#[derive(Error, Debug)]
pub enum IngesterError {
    /// Tenant identity missing or blank
    #[error("no tenant id supplied")]
    NoTenant,

    /// Sample timestamp not strictly after the series' last timestamp
    #[error("out of order sample: timestamp {timestamp} <= last {last}")]
    OutOfOrderSample { timestamp: Timestamp, last: Timestamp },

    /// Malformed label matcher
    #[error("invalid matcher: {0}")]
    InvalidMatcher(String),

    /// Durable store put/get failed
    #[error("chunk store unavailable: {0}")]
    StoreUnavailable(String),

    /// Append attempted after shutdown started
    #[error("ingester is stopped")]
    Stopped,

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Chunk encoding/decoding error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngesterError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngesterError::StoreUnavailable(_) | IngesterError::Io(_))
    }

    /// Check if error was caused by the caller's input
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            IngesterError::NoTenant
                | IngesterError::OutOfOrderSample { .. }
                | IngesterError::InvalidMatcher(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(IngesterError::StoreUnavailable("down".into()).is_retryable());
        assert!(!IngesterError::NoTenant.is_retryable());
        assert!(IngesterError::NoTenant.is_client_error());

        let err = IngesterError::OutOfOrderSample { timestamp: 5, last: 9 };
        assert!(err.is_client_error());
        assert!(err.to_string().contains("timestamp 5 <= last 9"));
    }
}
