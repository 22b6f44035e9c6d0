//! Error types for stream consumption and publishing.

use thiserror::Error;

/// Result type alias for event-stream operations.
pub type StreamResult<T> = Result<T, StreamError>;

#[derive(Error, Debug)]
pub enum StreamError {
    /// Redis operation failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Consumer group could not be created for a reason other than "already exists"
    #[error("Failed to create consumer group {group} on {stream}: {reason}")]
    ConsumerGroup {
        stream: String,
        group: String,
        reason: String,
    },

    /// Rejected at registration time
    #[error("Invalid handler binding: {0}")]
    InvalidHandler(String),

    /// A handler failed; the entry stays pending for redelivery
    #[error("Handler {owner} failed for {event_type} event {event_id}: {source}")]
    Handler {
        owner: String,
        event_type: String,
        event_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Operation not allowed in the consumer's current lifecycle state
    #[error("Invalid consumer state: {0}")]
    InvalidState(String),

    /// Stream or group missing, or other transport-level refusal
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Generic error with context
    #[error("Event stream error: {0}")]
    Other(#[from] anyhow::Error),
}

impl StreamError {
    /// Errors worth retrying on the next loop iteration.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            Self::Handler { .. } => true,
            _ => false,
        }
    }
}
