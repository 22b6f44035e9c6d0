//! Rate limiter and coalescer configuration.

use crate::error::{FlowControlError, FlowControlResult};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Burst allowance: maximum tokens a bucket holds
    pub capacity: u64,
    /// Sustained rate: tokens regained per second
    pub refill_rate: f64,
    /// Idle buckets are dropped after this many seconds
    pub ttl_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            refill_rate: 500.0,
            ttl_secs: 3600,
        }
    }
}

impl RateLimitConfig {
    /// Load from `RATE_LIMIT_CAPACITY`, `RATE_LIMIT_REFILL_RATE`, `RATE_LIMIT_TTL_SECS`.
    pub fn from_env() -> FlowControlResult<Self> {
        let defaults = Self::default();
        let config = Self {
            capacity: env_or("RATE_LIMIT_CAPACITY", defaults.capacity)?,
            refill_rate: env_or("RATE_LIMIT_REFILL_RATE", defaults.refill_rate)?,
            ttl_secs: env_or("RATE_LIMIT_TTL_SECS", defaults.ttl_secs)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FlowControlResult<()> {
        if self.capacity == 0 {
            return Err(FlowControlError::Configuration(
                "rate limit capacity must be greater than 0".to_string(),
            ));
        }
        if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
            return Err(FlowControlError::Configuration(format!(
                "rate limit refill rate must be a positive number, got {}",
                self.refill_rate
            )));
        }
        if self.ttl_secs == 0 {
            return Err(FlowControlError::Configuration(
                "rate limit TTL must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoalesceConfig {
    /// Batch size at which `enqueue` reports `should_flush`
    pub max_batch_size: u64,
    /// Orphaned batches expire after this many seconds
    pub ttl_secs: u64,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            ttl_secs: 60,
        }
    }
}

impl CoalesceConfig {
    /// Load from `COALESCE_MAX_BATCH_SIZE`, `COALESCE_TTL_SECS`.
    pub fn from_env() -> FlowControlResult<Self> {
        let defaults = Self::default();
        let config = Self {
            max_batch_size: env_or("COALESCE_MAX_BATCH_SIZE", defaults.max_batch_size)?,
            ttl_secs: env_or("COALESCE_TTL_SECS", defaults.ttl_secs)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FlowControlResult<()> {
        if self.max_batch_size == 0 {
            return Err(FlowControlError::Configuration(
                "coalesce max batch size must be greater than 0".to_string(),
            ));
        }
        if self.ttl_secs == 0 {
            return Err(FlowControlError::Configuration(
                "coalesce TTL must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> FlowControlResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            FlowControlError::Configuration(format!("{} has an invalid value: {:?}", name, raw))
        }),
        Err(_) => Ok(default),
    }
}
