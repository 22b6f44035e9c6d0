//! Per-key hybrid token + leaky bucket admission control.
//!
//! Each check is one atomic store transition keyed by `ratelimit:{caller}`. Rejection is an
//! ordinary [`RateLimitDecision`]; only storage failures and bad arguments are errors.
//!
//! Buckets are not stored under the legacy `{ratelimit}:<key>` wire key, which hashed every
//! caller to one slot. Buckets written under the legacy key are neither read nor migrated, so
//! callers start with a full bucket after the switch.

use crate::bucket::{refill, BucketRequest, RateLimitDecision};
use crate::config::RateLimitConfig;
use crate::error::{or_default, FlowControlError, FlowControlResult};
use crate::metrics::FlowControlMetrics;
use crate::store::BucketStore;
use redis_utils::{hash_tagged, Clock, SystemClock};
use std::sync::Arc;
use tracing::{debug, info};

pub const RATE_LIMIT_NAMESPACE: &str = "ratelimit";

pub struct HybridRateLimiter<S: BucketStore> {
    store: Arc<S>,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    metrics: Option<FlowControlMetrics>,
}

impl<S: BucketStore> HybridRateLimiter<S> {
    pub fn new(store: Arc<S>, config: RateLimitConfig) -> FlowControlResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            clock: Arc::new(SystemClock),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: FlowControlMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Take `requested` tokens from `key`'s bucket if it holds enough.
    ///
    /// A request larger than `capacity` is rejected like any other shortfall; its
    /// retry-after is still computed from the shortfall.
    pub async fn check_limit(&self, key: &str, requested: u64) -> FlowControlResult<RateLimitDecision> {
        if requested == 0 {
            return Err(FlowControlError::InvalidArgument(
                "requested tokens must be at least 1".to_string(),
            ));
        }
        let bucket_key = hash_tagged(RATE_LIMIT_NAMESPACE, key)?;
        let request = BucketRequest {
            requested,
            capacity: self.config.capacity,
            refill_rate: self.config.refill_rate,
            now_secs: self.clock.now_secs(),
            ttl_secs: self.config.ttl_secs,
        };

        let decision = self.store.take(&bucket_key, &request).await?;

        if let Some(metrics) = &self.metrics {
            let label = if decision.allowed { "allowed" } else { "rejected" };
            metrics.rate_limit_decisions.with_label_values(&[label]).inc();
        }
        if !decision.allowed {
            debug!(
                key = %key,
                requested,
                remaining_tokens = decision.remaining_tokens,
                retry_after_secs = decision.retry_after_secs,
                "Rate limit rejected request"
            );
        }

        Ok(decision)
    }

    /// Like [`check_limit`](Self::check_limit), but a rejection becomes
    /// [`FlowControlError::RateLimitExceeded`].
    pub async fn check_limit_or_throw(
        &self,
        key: &str,
        requested: u64,
    ) -> FlowControlResult<RateLimitDecision> {
        let decision = self.check_limit(key, requested).await?;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(FlowControlError::RateLimitExceeded {
                key: key.to_string(),
                retry_after_secs: decision.retry_after_secs,
                capacity: self.config.capacity,
                refill_rate: self.config.refill_rate,
            })
        }
    }

    /// Tokens available now, without consuming any. Falls back to `capacity` on error.
    pub async fn current_tokens(&self, key: &str) -> u64 {
        let result = self.projected_tokens(key).await;
        or_default(result, self.config.capacity, "current_tokens", key)
    }

    async fn projected_tokens(&self, key: &str) -> FlowControlResult<u64> {
        let bucket_key = hash_tagged(RATE_LIMIT_NAMESPACE, key)?;
        let state = self.store.load(&bucket_key).await?;
        let tokens = refill(
            state,
            self.config.capacity,
            self.config.refill_rate,
            self.clock.now_secs(),
        );
        Ok(tokens.floor() as u64)
    }

    /// Drop `key`'s bucket; the next check starts full.
    pub async fn reset(&self, key: &str) -> FlowControlResult<bool> {
        let bucket_key = hash_tagged(RATE_LIMIT_NAMESPACE, key)?;
        let existed = self.store.delete(&bucket_key).await?;
        info!(key = %key, existed, "Rate limit bucket reset");
        Ok(existed)
    }
}
