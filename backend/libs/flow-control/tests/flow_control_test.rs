//! Rate limiter and coalescer behaviour against the in-memory store.

use flow_control::{
    CoalesceConfig, CoalesceStatus, FlowControlError, HybridRateLimiter, InMemoryFlowStore,
    RateLimitConfig, RequestCoalescer,
};
use futures::future::join_all;
use redis_utils::ManualClock;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn shared_store(clock: &ManualClock) -> Arc<InMemoryFlowStore> {
    Arc::new(InMemoryFlowStore::with_clock(Arc::new(clock.clone())))
}

#[tokio::test]
async fn test_fixed_clock_full_burst_then_one_token() {
    let clock = ManualClock::new(1_700_000_000_000);
    let limiter = HybridRateLimiter::new(shared_store(&clock), RateLimitConfig::default())
        .unwrap()
        .with_clock(Arc::new(clock.clone()));

    let burst = assert_ok!(limiter.check_limit("user-1", 500).await);
    assert!(burst.allowed);

    let next = assert_ok!(limiter.check_limit("user-1", 1).await);
    assert!(!next.allowed);
    // ceil(1 / 500)
    assert_eq!(next.retry_after_secs, 1);

    clock.advance(Duration::from_secs(1));
    let refilled = assert_ok!(limiter.check_limit("user-1", 1).await);
    assert!(refilled.allowed);
    assert_eq!(refilled.remaining_tokens, 499);
}

#[tokio::test]
async fn test_concurrent_checks_never_overspend() {
    let clock = ManualClock::new(0);
    let config = RateLimitConfig {
        capacity: 50,
        refill_rate: 1.0,
        ttl_secs: 60,
    };
    let limiter = Arc::new(
        HybridRateLimiter::new(shared_store(&clock), config)
            .unwrap()
            .with_clock(Arc::new(clock.clone())),
    );

    let checks = (0..200).map(|_| {
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move { limiter.check_limit("hot-key", 1).await })
    });
    let decisions: Vec<_> = join_all(checks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let allowed = decisions.iter().filter(|d| d.allowed).count();
    assert_eq!(allowed, 50);
    assert!(decisions.iter().all(|d| d.remaining_tokens <= 50));
}

#[tokio::test]
async fn test_or_throw_surfaces_rejection() {
    let clock = ManualClock::new(0);
    let config = RateLimitConfig {
        capacity: 2,
        refill_rate: 0.25,
        ttl_secs: 60,
    };
    let limiter = HybridRateLimiter::new(shared_store(&clock), config)
        .unwrap()
        .with_clock(Arc::new(clock.clone()));

    assert_ok!(limiter.check_limit_or_throw("user-1", 2).await);
    let err = assert_err!(limiter.check_limit_or_throw("user-1", 1).await);
    assert!(matches!(
        err,
        FlowControlError::RateLimitExceeded {
            retry_after_secs: 4,
            capacity: 2,
            ..
        }
    ));
}

#[tokio::test]
async fn test_flush_threshold_and_empty_after_flush() {
    let clock = ManualClock::new(0);
    let coalescer = RequestCoalescer::new(shared_store(&clock), CoalesceConfig::default()).unwrap();

    let mut last = None;
    for i in 1..=10 {
        let outcome = assert_ok!(
            coalescer
                .coalesce("user-7", "like", &format!("e{i}"), &format!("data-{i}"), 10, 60)
                .await
        );
        assert_eq!(outcome.status, CoalesceStatus::Queued);
        assert_eq!(outcome.should_flush, i == 10);
        last = Some(outcome);
    }
    assert_eq!(last.map(|o| o.batch_count), Some(10));

    let flushed = assert_ok!(coalescer.flush_batch("user-7").await);
    let expected: Vec<String> = (1..=10).map(|i| format!("data-{i}")).collect();
    assert_eq!(flushed, expected);

    assert_eq!(coalescer.batch_count("user-7", "like").await, 0);
    assert_eq!(coalescer.total_batch_count("user-7").await, 0);
    assert!(assert_ok!(coalescer.flush_batch("user-7").await).is_empty());
}

#[tokio::test]
async fn test_concurrent_duplicate_adds_queue_once() {
    let coalescer = Arc::new(
        RequestCoalescer::new(Arc::new(InMemoryFlowStore::new()), CoalesceConfig::default())
            .unwrap(),
    );

    let adds = (0..20).map(|_| {
        let coalescer = Arc::clone(&coalescer);
        tokio::spawn(async move { coalescer.enqueue("user-3", "like", "same", "{}").await })
    });
    let outcomes: Vec<_> = join_all(adds)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let queued = outcomes
        .iter()
        .filter(|o| o.status == CoalesceStatus::Queued)
        .count();
    assert_eq!(queued, 1);
    assert!(outcomes.iter().all(|o| o.batch_count == 1));
}

#[tokio::test]
async fn test_batch_expires_without_flush() {
    let clock = ManualClock::new(0);
    let coalescer = RequestCoalescer::new(shared_store(&clock), CoalesceConfig::default()).unwrap();

    assert_ok!(coalescer.coalesce("user-5", "like", "e1", "{}", 10, 30).await);
    clock.advance(Duration::from_secs(31));

    assert_eq!(coalescer.total_batch_count("user-5").await, 0);
    let requeued = assert_ok!(coalescer.coalesce("user-5", "like", "e1", "{}", 10, 30).await);
    assert_eq!(requeued.status, CoalesceStatus::Queued);
}
