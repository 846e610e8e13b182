//! Error types for the rate limiting engine.

use thiserror::Error;

/// Main error type for rate limiter operations.
#[derive(Error, Debug)]
pub enum RateLimiterError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Allowance storage errors (backend unavailable, undecodable record)
    #[error("Storage error: {0}")]
    Storage(String),

    /// A rate limit entry that is not, and cannot be turned into, a definition
    #[error("Invalid rate limit definition: {0}")]
    InvalidDefinition(String),

    /// Raised by an observer to reject the current operation
    #[error("{message}")]
    TooManyRequests {
        /// Message surfaced to the client
        message: String,
        /// Seconds until at least one unit is available again, if known
        retry_after: Option<i64>,
    },

    /// JSON encoding errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateLimiterError {
    /// Whether this error is a rate limit rejection rather than a fault.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, RateLimiterError::TooManyRequests { .. })
    }

    /// Whether this error means the limiter itself is broken or misconfigured.
    pub fn is_operational(&self) -> bool {
        !self.is_rate_limited()
    }
}

/// Result type alias for rate limiter operations.
pub type Result<T> = std::result::Result<T, RateLimiterError>;
