//! # Flow Control
//!
//! Admission control for write paths, backed by atomic server-side scripts:
//!
//! - [`HybridRateLimiter`]: per-key token bucket (burst up to `capacity`) refilled at a
//!   sustained `refill_rate`. One script call per check; rejection is a normal decision.
//! - [`RequestCoalescer`]: per-key batch of pending updates, deduplicated by event id, with a
//!   flush signal once the batch reaches its size limit and an atomic read-and-delete flush.
//!
//! State never round-trips through the client for a read-modify-write. Every key a script
//! touches is hash-tagged with the caller id (`ratelimit:{user-42}`), so the scripts also run
//! on a sharded deployment.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use flow_control::{
//!     CoalesceConfig, CoalesceStatus, HybridRateLimiter, RateLimitConfig, RedisFlowStore,
//!     RequestCoalescer,
//! };
//! use redis_utils::RedisPool;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = RedisPool::connect("redis://127.0.0.1:6379").await?;
//! let store = Arc::new(RedisFlowStore::from_pool(&pool));
//!
//! let limiter = HybridRateLimiter::new(store.clone(), RateLimitConfig::from_env()?)?;
//! let coalescer = RequestCoalescer::new(store, CoalesceConfig::from_env()?)?;
//!
//! let decision = limiter.check_limit("user-42", 1).await?;
//! if decision.allowed {
//!     let outcome = coalescer
//!         .enqueue("user-42", "like", "evt-1", r#"{"post":7}"#)
//!         .await?;
//!     if outcome.status == CoalesceStatus::Queued && outcome.should_flush {
//!         let batch = coalescer.flush_batch("user-42").await?;
//!         println!("publishing {} coalesced updates", batch.len());
//!     }
//! } else {
//!     println!("retry after {}s", decision.retry_after_secs);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bucket;
pub mod coalescer;
pub mod config;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod rate_limiter;
pub mod scripts;
pub mod store;

pub use bucket::{refill_and_take, BucketRequest, BucketState, RateLimitDecision};
pub use coalescer::{CoalesceOutcome, CoalesceStatus, RequestCoalescer};
pub use config::{CoalesceConfig, RateLimitConfig};
pub use error::{FlowControlError, FlowControlResult};
pub use memory::InMemoryFlowStore;
pub use metrics::FlowControlMetrics;
pub use rate_limiter::HybridRateLimiter;
pub use store::{BatchKeys, BatchStore, BucketStore, CoalesceRequest, RedisFlowStore};
