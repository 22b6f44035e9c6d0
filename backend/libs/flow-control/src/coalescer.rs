//! Per-key request batching with in-batch event id deduplication.
//!
//! A batch lives at `coalesce:{key}` (event id -> data) with its counter at
//! `coalesce:counter:{key}`. Both share the caller's hash tag, so the add and flush scripts
//! stay on one slot.
//!
//! This layout is not the legacy `{coalesce}:<key>` / `{coalesce}:counter:<key>` wire keys,
//! which pinned every batch to one slot. Batches written under the legacy keys are neither
//! read nor migrated; drain them before switching writers over.

use crate::config::CoalesceConfig;
use crate::error::{or_default, FlowControlError, FlowControlResult};
use crate::metrics::FlowControlMetrics;
use crate::store::{BatchKeys, BatchStore, CoalesceRequest};
use redis_utils::hash_tagged;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

pub const BATCH_NAMESPACE: &str = "coalesce";
pub const COUNTER_NAMESPACE: &str = "coalesce:counter";
const TOTAL_FIELD: &str = "total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalesceStatus {
    Queued,
    Duplicate,
}

impl CoalesceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Duplicate => "duplicate",
        }
    }
}

impl fmt::Display for CoalesceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalesceOutcome {
    pub status: CoalesceStatus,
    /// Live entries in the batch after this call
    pub batch_count: u64,
    /// The batch reached `max_batch_size`; the caller should flush it
    pub should_flush: bool,
}

pub struct RequestCoalescer<S: BatchStore> {
    store: Arc<S>,
    config: CoalesceConfig,
    metrics: Option<FlowControlMetrics>,
}

impl<S: BatchStore> RequestCoalescer<S> {
    pub fn new(store: Arc<S>, config: CoalesceConfig) -> FlowControlResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: FlowControlMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &CoalesceConfig {
        &self.config
    }

    /// Add `event_id -> event_data` to `key`'s batch unless the id is already there.
    pub async fn coalesce(
        &self,
        key: &str,
        event_type: &str,
        event_id: &str,
        event_data: &str,
        max_batch_size: u64,
        ttl_secs: u64,
    ) -> FlowControlResult<CoalesceOutcome> {
        if event_type.is_empty() || event_id.is_empty() {
            return Err(FlowControlError::InvalidArgument(
                "event type and event id must not be empty".to_string(),
            ));
        }
        if max_batch_size == 0 || ttl_secs == 0 {
            return Err(FlowControlError::InvalidArgument(format!(
                "max batch size and TTL must be positive, got {} and {}",
                max_batch_size, ttl_secs
            )));
        }

        let keys = batch_keys(key)?;
        let request = CoalesceRequest {
            event_type,
            event_id,
            event_data,
            max_batch_size,
            ttl_secs,
        };
        let outcome = self.store.add(&keys, &request).await?;

        if let Some(metrics) = &self.metrics {
            metrics
                .coalesce_results
                .with_label_values(&[outcome.status.as_str()])
                .inc();
        }
        debug!(
            key = %key,
            event_type = %event_type,
            event_id = %event_id,
            status = %outcome.status,
            batch_count = outcome.batch_count,
            should_flush = outcome.should_flush,
            "Coalesced request"
        );

        Ok(outcome)
    }

    /// [`coalesce`](Self::coalesce) with the configured batch size and TTL.
    pub async fn enqueue(
        &self,
        key: &str,
        event_type: &str,
        event_id: &str,
        event_data: &str,
    ) -> FlowControlResult<CoalesceOutcome> {
        self.coalesce(
            key,
            event_type,
            event_id,
            event_data,
            self.config.max_batch_size,
            self.config.ttl_secs,
        )
        .await
    }

    /// Atomically take every entry of `key`'s batch and delete it.
    pub async fn flush_batch(&self, key: &str) -> FlowControlResult<Vec<String>> {
        let keys = batch_keys(key)?;
        let entries = self.store.drain(&keys).await?;

        if let Some(metrics) = &self.metrics {
            metrics.coalesce_flushed_entries.inc_by(entries.len() as u64);
        }
        info!(key = %key, flushed = entries.len(), "Flushed coalesce batch");

        Ok(entries)
    }

    /// Entries of `event_type` queued in `key`'s batch. `0` on error.
    pub async fn batch_count(&self, key: &str, event_type: &str) -> u64 {
        let field = format!("type:{}", event_type);
        let result = self.counter(key, &field).await;
        or_default(result, 0, "batch_count", key)
    }

    /// All entries queued in `key`'s batch. `0` on error.
    pub async fn total_batch_count(&self, key: &str) -> u64 {
        let result = self.counter(key, TOTAL_FIELD).await;
        or_default(result, 0, "total_batch_count", key)
    }

    async fn counter(&self, key: &str, field: &str) -> FlowControlResult<u64> {
        let keys = batch_keys(key)?;
        self.store.counter(&keys.counter, field).await
    }
}

fn batch_keys(key: &str) -> FlowControlResult<BatchKeys> {
    Ok(BatchKeys {
        batch: hash_tagged(BATCH_NAMESPACE, key)?,
        counter: hash_tagged(COUNTER_NAMESPACE, key)?,
    })
}
