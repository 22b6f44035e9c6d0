//! Processed-event-id filter with per-entry TTL.
//!
//! Redis layout: one sorted set at `{prefix}processed`, member = event id, score = expiry in
//! epoch milliseconds. Expired members are pruned inside the same script that checks and
//! inserts, so the first-sighting decision is atomic across consumers.

use crate::config::DedupConfig;
use crate::error::StreamResult;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use redis_utils::{Clock, RedisPool, SystemClock};
use std::sync::Arc;
use tracing::{debug, warn};

/// `KEYS[1]` set, `ARGV` = event id, now (ms), ttl (ms). Returns 1 on first sighting.
static DEDUP_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local key = KEYS[1]
local member = ARGV[1]
local now = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now)
if redis.call('ZSCORE', key, member) then
  return 0
end

redis.call('ZADD', key, now + ttl, member)
if redis.call('PTTL', key) < ttl then
  redis.call('PEXPIRE', key, ttl)
end
return 1
"#,
    )
});

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Insert unless a live entry exists. Returns `true` when inserted.
    async fn insert_if_absent(
        &self,
        set_key: &str,
        event_id: &str,
        now_ms: u64,
        ttl_ms: u64,
    ) -> StreamResult<bool>;

    async fn remove(&self, set_key: &str, event_id: &str) -> StreamResult<bool>;

    /// Entries whose expiry is after `now_ms`.
    async fn live_count(&self, set_key: &str, now_ms: u64) -> StreamResult<u64>;
}

#[derive(Clone)]
pub struct RedisDedupStore {
    conn: ConnectionManager,
}

impl RedisDedupStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub fn from_pool(pool: &RedisPool) -> Self {
        Self::new(pool.manager())
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn insert_if_absent(
        &self,
        set_key: &str,
        event_id: &str,
        now_ms: u64,
        ttl_ms: u64,
    ) -> StreamResult<bool> {
        let mut conn = self.conn.clone();
        let inserted: i64 = DEDUP_SCRIPT
            .key(set_key)
            .arg(event_id)
            .arg(now_ms)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(inserted == 1)
    }

    async fn remove(&self, set_key: &str, event_id: &str) -> StreamResult<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.zrem(set_key, event_id).await?;
        Ok(removed > 0)
    }

    async fn live_count(&self, set_key: &str, now_ms: u64) -> StreamResult<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = conn
            .zcount(set_key, format!("({}", now_ms), "+inf")
            .await?;
        Ok(count)
    }
}

/// Answers "has this event id been processed" once per TTL window.
pub struct DeduplicationFilter<D: DedupStore> {
    store: Arc<D>,
    set_key: String,
    ttl_ms: u64,
    clock: Arc<dyn Clock>,
}

impl<D: DedupStore> DeduplicationFilter<D> {
    pub fn new(store: Arc<D>, config: DedupConfig) -> StreamResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            set_key: config.set_key(),
            ttl_ms: u64::try_from(config.ttl.as_millis()).unwrap_or(u64::MAX),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn set_key(&self) -> &str {
        &self.set_key
    }

    /// Check and mark in one step. `false` means first sighting, and the id is now marked.
    ///
    /// Fails open: a storage error returns `false` so delivery is never dropped here.
    pub async fn is_duplicate(&self, event_id: &str) -> bool {
        let now_ms = self.clock.now_millis();
        match self
            .store
            .insert_if_absent(&self.set_key, event_id, now_ms, self.ttl_ms)
            .await
        {
            Ok(inserted) => !inserted,
            Err(e) => {
                warn!(
                    event_id = %event_id,
                    error = %e,
                    "Deduplication check failed; treating event as new"
                );
                false
            }
        }
    }

    /// Mark an id processed without dispatching, e.g. after a manual compensation.
    pub async fn mark_processed(&self, event_id: &str) -> StreamResult<()> {
        let now_ms = self.clock.now_millis();
        let inserted = self
            .store
            .insert_if_absent(&self.set_key, event_id, now_ms, self.ttl_ms)
            .await?;
        debug!(event_id = %event_id, already_marked = !inserted, "Marked event processed");
        Ok(())
    }

    /// Forget an id so its next delivery is dispatched again.
    pub async fn release(&self, event_id: &str) -> StreamResult<()> {
        self.store.remove(&self.set_key, event_id).await?;
        debug!(event_id = %event_id, "Released deduplication mark");
        Ok(())
    }

    /// Live marks; monitoring only, `0` on error.
    pub async fn size(&self) -> u64 {
        let now_ms = self.clock.now_millis();
        match self.store.live_count(&self.set_key, now_ms).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Failed to read deduplication set size");
                0
            }
        }
    }
}
