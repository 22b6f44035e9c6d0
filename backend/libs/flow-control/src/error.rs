//! Error types for rate limiting and request coalescing.

use redis_utils::KeyError;
use std::fmt::Display;
use thiserror::Error;
use tracing::warn;

/// Result type alias for flow-control operations.
pub type FlowControlResult<T> = Result<T, FlowControlError>;

#[derive(Error, Debug)]
pub enum FlowControlError {
    /// Backing store unreachable or script failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Raised by `check_limit_or_throw` only; `check_limit` reports rejection as a decision
    #[error("Rate limit exceeded for {key}: retry after {retry_after_secs}s (capacity {capacity}, refill {refill_rate}/s)")]
    RateLimitExceeded {
        key: String,
        retry_after_secs: u64,
        capacity: u64,
        refill_rate: f64,
    },

    /// Script returned something other than the three-element status reply
    #[error("Unexpected script reply: {0}")]
    UnexpectedReply(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl FlowControlError {
    /// Storage failures a caller may retry. Validation and rejection are final.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            _ => false,
        }
    }
}

/// Monitoring reads never propagate: log and fall back.
pub(crate) fn or_default<T: Display>(
    result: FlowControlResult<T>,
    default: T,
    operation: &'static str,
    key: &str,
) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!(
                operation,
                key = %key,
                error = %e,
                fallback = %default,
                "Monitoring read failed; using fallback"
            );
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_or_default_falls_back_on_error() {
        let failed: FlowControlResult<u64> =
            Err(FlowControlError::UnexpectedReply("nil".to_string()));
        assert_eq!(or_default(failed, 500, "current_tokens", "u1"), 500);
        assert_eq!(or_default(Ok(7), 500, "current_tokens", "u1"), 7);
    }

    #[test]
    fn test_rejection_is_not_transient() {
        let err = FlowControlError::RateLimitExceeded {
            key: "u1".to_string(),
            retry_after_secs: 1,
            capacity: 500,
            refill_rate: 500.0,
        };
        assert!(!err.is_transient());
        assert!(err.to_string().contains("retry after 1s"));
    }
}
