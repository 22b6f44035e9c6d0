//! Stream Worker - consumes integration events and exercises the producer path
//!
//! Producer side: every simulated like passes the rate limiter, is coalesced per user, and
//! once a user's batch is full the batch is flushed into one `LikesBatched` event on the
//! stream. Consumer side: the consumer group drains the stream and dispatches to handlers.
//!
//! Environment variables:
//! - REDIS_URL: Redis connection string (default: "redis://127.0.0.1:6379")
//! - EVENT_STREAM_KEY, EVENT_CONSUMER_GROUP, EVENT_CONSUMER_NAME: stream identity
//! - EVENT_READ_TIMEOUT_MS, EVENT_READ_BATCH_SIZE, EVENT_PENDING_REPLAY_SECS: consume loop
//! - EVENT_DEDUP_KEY_PREFIX, EVENT_DEDUP_TTL_SECS: deduplication window
//! - RATE_LIMIT_CAPACITY, RATE_LIMIT_REFILL_RATE, RATE_LIMIT_TTL_SECS: admission control
//! - COALESCE_MAX_BATCH_SIZE, COALESCE_TTL_SECS: batching
//! - METRICS_SERVICE_NAME: `service` label on exported metrics (default: "stream-worker")

use event_stream::{
    ConsumerConfig, ConsumerMetrics, DedupConfig, DeduplicationFilter, HandlerRegistry,
    IntegrationEvent, PublisherConfig, RedisDedupStore, RedisStreamTransport, StreamConsumer,
    StreamPublisher, TypedEvent,
};
use flow_control::{
    CoalesceConfig, CoalesceStatus, FlowControlMetrics, HybridRateLimiter, RateLimitConfig,
    RedisFlowStore, RequestCoalescer,
};
use redis_utils::RedisPool;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Deserialize)]
struct LikesBatched {
    user_id: String,
    likes: Vec<serde_json::Value>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Starting stream worker");

    let service =
        std::env::var("METRICS_SERVICE_NAME").unwrap_or_else(|_| "stream-worker".to_string());
    let pool = RedisPool::from_env().await?;
    info!(redis = %pool.address(), "Redis connected");

    // Producer path
    let flow_store = Arc::new(RedisFlowStore::from_pool(&pool));
    let flow_metrics = FlowControlMetrics::new(&service);
    let limiter = HybridRateLimiter::new(Arc::clone(&flow_store), RateLimitConfig::from_env()?)?
        .with_metrics(flow_metrics.clone());
    let coalescer = RequestCoalescer::new(flow_store, CoalesceConfig::from_env()?)?
        .with_metrics(flow_metrics);

    let transport = Arc::new(RedisStreamTransport::connect(&pool).await?);
    let publisher = StreamPublisher::from_config(Arc::clone(&transport), PublisherConfig::from_env()?);

    // Consumer path
    let dedup = DeduplicationFilter::new(
        Arc::new(RedisDedupStore::from_pool(&pool)),
        DedupConfig::from_env()?,
    )?;
    let mut consumer = StreamConsumer::new(transport, dedup, ConsumerConfig::from_env()?)
        .await?
        .with_metrics(ConsumerMetrics::new(&service));

    let mut registry = HandlerRegistry::new();
    registry.register(
        "LikesBatched",
        "like-projector",
        |event: TypedEvent<LikesBatched>| async move {
            info!(
                event_id = %event.event_id,
                user_id = %event.payload.user_id,
                likes = event.payload.likes.len(),
                "Projected like batch"
            );
            Ok(())
        },
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl+c");
        }
        info!("Shutdown signal received");
        let _ = signal_tx.send(true);
    });

    let consumer_task = tokio::spawn(async move { consumer.start(registry, shutdown_rx).await });

    // Simulated write traffic
    let mut producer_shutdown = shutdown_tx.subscribe();
    let mut tick = tokio::time::interval(Duration::from_millis(200));
    let mut sequence: u64 = 0;
    loop {
        tokio::select! {
            _ = producer_shutdown.changed() => break,
            _ = tick.tick() => {}
        }
        sequence += 1;
        let user_id = format!("user-{}", sequence % 3);

        let decision = limiter.check_limit(&user_id, 1).await?;
        if !decision.allowed {
            warn!(
                user_id = %user_id,
                retry_after_secs = decision.retry_after_secs,
                "Like rejected by rate limiter"
            );
            continue;
        }

        let like_id = uuid::Uuid::new_v4().to_string();
        let data = json!({"like_id": like_id, "post_id": sequence}).to_string();
        let outcome = coalescer.enqueue(&user_id, "LikeCreated", &like_id, &data).await?;
        if outcome.status == CoalesceStatus::Duplicate || !outcome.should_flush {
            continue;
        }

        let likes = coalescer
            .flush_batch(&user_id)
            .await?
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect::<Vec<serde_json::Value>>();
        let event = IntegrationEvent::new(
            "LikesBatched",
            json!({"user_id": user_id, "likes": likes}),
        )
        .with_metadata("source", "stream-worker");
        let entry_id = publisher.publish(&event).await?;
        info!(entry_id = %entry_id, user_id = %user_id, "Published like batch");
    }

    consumer_task.await??;
    info!("Stream worker stopped");
    Ok(())
}
