//! Single-process store with the same atomicity as the Redis scripts.
//!
//! One mutex guards all state, so each trait call is one indivisible transition.
//! TTLs are enforced lazily against the injected clock: a call drops the expired keys it
//! touches, and untouched keys are swept at most once per [`SWEEP_INTERVAL_MS`].

use crate::bucket::{refill_and_take, BucketRequest, BucketState, RateLimitDecision};
use crate::coalescer::{CoalesceOutcome, CoalesceStatus};
use crate::error::FlowControlResult;
use crate::store::{BatchKeys, BatchStore, BucketStore, CoalesceRequest};
use async_trait::async_trait;
use redis_utils::{Clock, SystemClock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Minimum gap between full sweeps of untouched expired keys.
pub const SWEEP_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at_ms: u64,
}

fn expiry(now_ms: u64, ttl_secs: u64) -> u64 {
    now_ms.saturating_add(ttl_secs.saturating_mul(1000))
}

/// Drop `key` from `map` if it has expired.
fn evict_expired<T>(map: &mut HashMap<String, Expiring<T>>, key: &str, now_ms: u64) {
    if map.get(key).is_some_and(|e| e.expires_at_ms <= now_ms) {
        map.remove(key);
    }
}

#[derive(Debug, Default)]
struct Batch {
    /// Insertion-ordered (event id, data)
    entries: Vec<(String, String)>,
}

#[derive(Default)]
struct State {
    buckets: HashMap<String, Expiring<BucketState>>,
    batches: HashMap<String, Expiring<Batch>>,
    counters: HashMap<String, Expiring<HashMap<String, u64>>>,
    swept_at_ms: u64,
}

impl State {
    fn sweep_if_due(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.swept_at_ms) < SWEEP_INTERVAL_MS {
            return;
        }
        self.buckets.retain(|_, b| b.expires_at_ms > now_ms);
        self.batches.retain(|_, b| b.expires_at_ms > now_ms);
        self.counters.retain(|_, c| c.expires_at_ms > now_ms);
        self.swept_at_ms = now_ms;
    }

    fn evict_bucket(&mut self, key: &str, now_ms: u64) {
        evict_expired(&mut self.buckets, key, now_ms);
    }

    fn evict_batch(&mut self, keys: &BatchKeys, now_ms: u64) {
        evict_expired(&mut self.batches, &keys.batch, now_ms);
        evict_expired(&mut self.counters, &keys.counter, now_ms);
    }
}

#[derive(Clone)]
pub struct InMemoryFlowStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryFlowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
        }
    }

    async fn locked(&self) -> (tokio::sync::MutexGuard<'_, State>, u64) {
        let now_ms = self.clock.now_millis();
        let mut state = self.state.lock().await;
        state.sweep_if_due(now_ms);
        (state, now_ms)
    }
}

#[async_trait]
impl BucketStore for InMemoryFlowStore {
    async fn take(&self, key: &str, request: &BucketRequest) -> FlowControlResult<RateLimitDecision> {
        let (mut state, now_ms) = self.locked().await;
        state.evict_bucket(key, now_ms);
        let current = state.buckets.get(key).map(|b| b.value);
        let (next, decision) = refill_and_take(current, request);
        state.buckets.insert(
            key.to_string(),
            Expiring {
                value: next,
                expires_at_ms: expiry(now_ms, request.ttl_secs),
            },
        );
        Ok(decision)
    }

    async fn load(&self, key: &str) -> FlowControlResult<Option<BucketState>> {
        let (mut state, now_ms) = self.locked().await;
        state.evict_bucket(key, now_ms);
        Ok(state.buckets.get(key).map(|b| b.value))
    }

    async fn delete(&self, key: &str) -> FlowControlResult<bool> {
        let (mut state, now_ms) = self.locked().await;
        state.evict_bucket(key, now_ms);
        Ok(state.buckets.remove(key).is_some())
    }
}

#[async_trait]
impl BatchStore for InMemoryFlowStore {
    async fn add(
        &self,
        keys: &BatchKeys,
        request: &CoalesceRequest<'_>,
    ) -> FlowControlResult<CoalesceOutcome> {
        let (mut state, now_ms) = self.locked().await;
        state.evict_batch(keys, now_ms);
        let expires_at_ms = expiry(now_ms, request.ttl_secs);

        if let Some(batch) = state.batches.get(&keys.batch) {
            if batch.value.entries.iter().any(|(id, _)| id == request.event_id) {
                return Ok(CoalesceOutcome {
                    status: CoalesceStatus::Duplicate,
                    batch_count: batch.value.entries.len() as u64,
                    should_flush: false,
                });
            }
        }

        let batch = state
            .batches
            .entry(keys.batch.clone())
            .or_insert_with(|| Expiring {
                value: Batch::default(),
                expires_at_ms,
            });
        batch
            .value
            .entries
            .push((request.event_id.to_string(), request.event_data.to_string()));
        batch.expires_at_ms = expires_at_ms;
        let count = batch.value.entries.len() as u64;

        let counter = state
            .counters
            .entry(keys.counter.clone())
            .or_insert_with(|| Expiring {
                value: HashMap::new(),
                expires_at_ms,
            });
        counter.value.insert("total".to_string(), count);
        *counter
            .value
            .entry(format!("type:{}", request.event_type))
            .or_insert(0) += 1;
        counter.expires_at_ms = expires_at_ms;

        Ok(CoalesceOutcome {
            status: CoalesceStatus::Queued,
            batch_count: count,
            should_flush: count >= request.max_batch_size,
        })
    }

    async fn drain(&self, keys: &BatchKeys) -> FlowControlResult<Vec<String>> {
        let (mut state, now_ms) = self.locked().await;
        state.evict_batch(keys, now_ms);
        state.counters.remove(&keys.counter);
        Ok(state
            .batches
            .remove(&keys.batch)
            .map(|b| b.value.entries.into_iter().map(|(_, data)| data).collect())
            .unwrap_or_default())
    }

    async fn counter(&self, counter_key: &str, field: &str) -> FlowControlResult<u64> {
        let (mut state, now_ms) = self.locked().await;
        evict_expired(&mut state.counters, counter_key, now_ms);
        Ok(state
            .counters
            .get(counter_key)
            .and_then(|c| c.value.get(field).copied())
            .unwrap_or(0))
    }
}
