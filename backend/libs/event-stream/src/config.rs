//! Consumer, deduplication, and publisher configuration.

use crate::error::{StreamError, StreamResult};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_STREAM_KEY: &str = "integration-events";
pub const DEFAULT_GROUP_NAME: &str = "event-processors";

/// Configuration for the consumer group reader
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    pub stream_key: String,
    pub group_name: String,
    /// Unique per process
    pub consumer_name: String,
    /// Upper bound on one blocking read
    pub read_timeout: Duration,
    pub batch_size: usize,
    /// How often this consumer's unacknowledged entries are re-read
    pub pending_replay_interval: Duration,
    /// Pause after a failed read before trying again
    pub error_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            group_name: DEFAULT_GROUP_NAME.to_string(),
            consumer_name: default_consumer_name(),
            read_timeout: Duration::from_millis(2000),
            batch_size: 10,
            pending_replay_interval: Duration::from_secs(30),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl ConsumerConfig {
    pub fn from_env() -> StreamResult<Self> {
        let defaults = Self::default();
        let config = Self {
            stream_key: std::env::var("EVENT_STREAM_KEY").unwrap_or(defaults.stream_key),
            group_name: std::env::var("EVENT_CONSUMER_GROUP").unwrap_or(defaults.group_name),
            consumer_name: std::env::var("EVENT_CONSUMER_NAME")
                .unwrap_or(defaults.consumer_name),
            read_timeout: Duration::from_millis(env_or(
                "EVENT_READ_TIMEOUT_MS",
                defaults.read_timeout.as_millis() as u64,
            )?),
            batch_size: env_or("EVENT_READ_BATCH_SIZE", defaults.batch_size)?,
            pending_replay_interval: Duration::from_secs(env_or(
                "EVENT_PENDING_REPLAY_SECS",
                defaults.pending_replay_interval.as_secs(),
            )?),
            error_backoff: defaults.error_backoff,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StreamResult<()> {
        for (name, value) in [
            ("stream key", &self.stream_key),
            ("consumer group", &self.group_name),
            ("consumer name", &self.consumer_name),
        ] {
            if value.trim().is_empty() {
                return Err(StreamError::Configuration(format!("{} must not be empty", name)));
            }
        }
        if self.batch_size == 0 {
            return Err(StreamError::Configuration(
                "read batch size must be greater than 0".to_string(),
            ));
        }
        if self.read_timeout.is_zero() {
            // BLOCK 0 would block forever and starve the shutdown check
            return Err(StreamError::Configuration(
                "read timeout must be greater than 0".to_string(),
            ));
        }
        if self.pending_replay_interval.is_zero() {
            return Err(StreamError::Configuration(
                "pending replay interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// `<HOSTNAME>-<pid>`, falling back to `localhost`.
pub fn default_consumer_name() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}-{}", host, std::process::id())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupConfig {
    /// The processed-id set lives at `{key_prefix}processed`
    pub key_prefix: String,
    pub ttl: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            key_prefix: "event:dedup:".to_string(),
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl DedupConfig {
    pub fn from_env() -> StreamResult<Self> {
        let defaults = Self::default();
        let config = Self {
            key_prefix: std::env::var("EVENT_DEDUP_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            ttl: Duration::from_secs(env_or("EVENT_DEDUP_TTL_SECS", defaults.ttl.as_secs())?),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StreamResult<()> {
        if self.ttl.as_millis() == 0 {
            return Err(StreamError::Configuration(
                "dedup TTL must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn set_key(&self) -> String {
        format!("{}processed", self.key_prefix)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    pub stream_key: String,
    /// Approximate `MAXLEN ~` cap; unbounded when `None`
    pub max_len: Option<usize>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            max_len: None,
        }
    }
}

impl PublisherConfig {
    pub fn from_env() -> StreamResult<Self> {
        let max_len = match std::env::var("EVENT_STREAM_MAX_LEN") {
            Ok(_) => Some(env_or("EVENT_STREAM_MAX_LEN", 0usize)?),
            Err(_) => None,
        };
        Ok(Self {
            stream_key: std::env::var("EVENT_STREAM_KEY")
                .unwrap_or_else(|_| DEFAULT_STREAM_KEY.to_string()),
            max_len: max_len.filter(|n| *n > 0),
        })
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> StreamResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            StreamError::Configuration(format!("{} has an invalid value: {:?}", name, raw))
        }),
        Err(_) => Ok(default),
    }
}
