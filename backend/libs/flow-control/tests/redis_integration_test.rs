//! Script-level tests against a live Redis.
//!
//! Run with: cargo test -p flow-control --test redis_integration_test -- --ignored

use flow_control::{
    CoalesceConfig, CoalesceStatus, HybridRateLimiter, RateLimitConfig, RedisFlowStore,
    RequestCoalescer,
};
use redis_utils::{ManualClock, RedisPool};
use std::sync::Arc;
use std::time::Duration;

async fn store() -> (RedisPool, Arc<RedisFlowStore>) {
    let pool = RedisPool::from_env().await.expect("Failed to connect to Redis");
    let store = Arc::new(RedisFlowStore::from_pool(&pool));
    (pool, store)
}

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, std::process::id())
}

#[tokio::test]
#[ignore] // Requires Redis server
#[serial_test::serial]
async fn test_rate_limit_script_determinism() {
    let (_pool, store) = store().await;
    let clock = ManualClock::new(1_700_000_000_000);
    let config = RateLimitConfig {
        capacity: 20,
        refill_rate: 4.0,
        ttl_secs: 60,
    };
    let limiter = HybridRateLimiter::new(store, config)
        .unwrap()
        .with_clock(Arc::new(clock.clone()));
    let key = unique("rl-determinism");
    limiter.reset(&key).await.unwrap();

    let burst = limiter.check_limit(&key, 20).await.unwrap();
    assert!(burst.allowed);
    assert_eq!(burst.remaining_tokens, 0);

    let rejected = limiter.check_limit(&key, 1).await.unwrap();
    assert!(!rejected.allowed);
    assert_eq!(rejected.retry_after_secs, 1);

    clock.advance(Duration::from_secs(2));
    assert_eq!(limiter.current_tokens(&key).await, 8);
    let refilled = limiter.check_limit(&key, 8).await.unwrap();
    assert!(refilled.allowed);

    assert!(limiter.reset(&key).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires Redis server
#[serial_test::serial]
async fn test_coalesce_script_dedup_and_flush() {
    let (_pool, store) = store().await;
    let coalescer = RequestCoalescer::new(store, CoalesceConfig::default()).unwrap();
    let key = unique("co-flush");
    coalescer.flush_batch(&key).await.unwrap();

    let first = coalescer.coalesce(&key, "like", "e1", "d1", 3, 60).await.unwrap();
    assert_eq!(first.status, CoalesceStatus::Queued);
    let dup = coalescer.coalesce(&key, "like", "e1", "d1", 3, 60).await.unwrap();
    assert_eq!(dup.status, CoalesceStatus::Duplicate);
    assert_eq!(dup.batch_count, 1);

    coalescer.coalesce(&key, "like", "e2", "d2", 3, 60).await.unwrap();
    let third = coalescer.coalesce(&key, "follow", "e3", "d3", 3, 60).await.unwrap();
    assert!(third.should_flush);
    assert_eq!(coalescer.batch_count(&key, "like").await, 2);
    assert_eq!(coalescer.total_batch_count(&key).await, 3);

    let mut flushed = coalescer.flush_batch(&key).await.unwrap();
    flushed.sort();
    assert_eq!(flushed, vec!["d1", "d2", "d3"]);
    assert_eq!(coalescer.batch_count(&key, "like").await, 0);
}
