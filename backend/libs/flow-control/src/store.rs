//! Storage seams and the Redis-backed implementation.

use crate::bucket::{BucketRequest, BucketState, RateLimitDecision};
use crate::coalescer::CoalesceOutcome;
use crate::error::FlowControlResult;
use crate::scripts::{
    parse_coalesce_reply, parse_rate_limit_reply, COALESCE_SCRIPT, FLUSH_SCRIPT,
    RATE_LIMIT_SCRIPT,
};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use redis_utils::RedisPool;

/// Keys of one coalesce batch. Both carry the same hash tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchKeys {
    pub batch: String,
    pub counter: String,
}

#[derive(Debug, Clone, Copy)]
pub struct CoalesceRequest<'a> {
    pub event_type: &'a str,
    pub event_id: &'a str,
    pub event_data: &'a str,
    pub max_batch_size: u64,
    pub ttl_secs: u64,
}

/// Token bucket state. `take` must be a single atomic transition.
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn take(&self, key: &str, request: &BucketRequest) -> FlowControlResult<RateLimitDecision>;

    async fn load(&self, key: &str) -> FlowControlResult<Option<BucketState>>;

    /// Returns whether a bucket existed.
    async fn delete(&self, key: &str) -> FlowControlResult<bool>;
}

/// Coalesce batches. `add` and `drain` must each be a single atomic transition.
#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn add(
        &self,
        keys: &BatchKeys,
        request: &CoalesceRequest<'_>,
    ) -> FlowControlResult<CoalesceOutcome>;

    /// Remove the batch and its counter, returning the entries' data.
    async fn drain(&self, keys: &BatchKeys) -> FlowControlResult<Vec<String>>;

    /// A counter field (`total` or `type:<event type>`); `0` when absent.
    async fn counter(&self, counter_key: &str, field: &str) -> FlowControlResult<u64>;
}

/// Both seams over one multiplexed connection, via `EVALSHA`.
#[derive(Clone)]
pub struct RedisFlowStore {
    conn: ConnectionManager,
}

impl RedisFlowStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub fn from_pool(pool: &RedisPool) -> Self {
        Self::new(pool.manager())
    }
}

#[async_trait]
impl BucketStore for RedisFlowStore {
    async fn take(&self, key: &str, request: &BucketRequest) -> FlowControlResult<RateLimitDecision> {
        let mut conn = self.conn.clone();
        let reply: Vec<String> = RATE_LIMIT_SCRIPT
            .key(key)
            .arg(request.requested)
            .arg(request.capacity)
            .arg(request.refill_rate)
            .arg(request.now_secs)
            .arg(request.ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        parse_rate_limit_reply(reply)
    }

    async fn load(&self, key: &str) -> FlowControlResult<Option<BucketState>> {
        let mut conn = self.conn.clone();
        let (tokens, ts): (Option<f64>, Option<u64>) = redis::cmd("HMGET")
            .arg(key)
            .arg("tokens")
            .arg("ts")
            .query_async(&mut conn)
            .await?;
        Ok(match (tokens, ts) {
            (Some(tokens), Some(last_refill_secs)) => Some(BucketState {
                tokens,
                last_refill_secs,
            }),
            _ => None,
        })
    }

    async fn delete(&self, key: &str) -> FlowControlResult<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl BatchStore for RedisFlowStore {
    async fn add(
        &self,
        keys: &BatchKeys,
        request: &CoalesceRequest<'_>,
    ) -> FlowControlResult<CoalesceOutcome> {
        let mut conn = self.conn.clone();
        let reply: Vec<String> = COALESCE_SCRIPT
            .key(&keys.batch)
            .key(&keys.counter)
            .arg(request.event_type)
            .arg(request.event_id)
            .arg(request.event_data)
            .arg(request.max_batch_size)
            .arg(request.ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        parse_coalesce_reply(reply)
    }

    async fn drain(&self, keys: &BatchKeys) -> FlowControlResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let entries: Vec<String> = FLUSH_SCRIPT
            .key(&keys.batch)
            .key(&keys.counter)
            .invoke_async(&mut conn)
            .await?;
        Ok(entries)
    }

    async fn counter(&self, counter_key: &str, field: &str) -> FlowControlResult<u64> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = conn.hget(counter_key, field).await?;
        Ok(value.unwrap_or(0))
    }
}
