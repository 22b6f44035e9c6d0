//! # Event Stream
//!
//! Reliable consumption of integration events from a Redis stream through a consumer group.
//!
//! The stream delivers at least once. Exactly-once *effect* comes from two things working
//! together:
//!
//! - entries are acknowledged only after every handler for the event succeeded, so a failure
//!   or crash leaves the entry pending and it is delivered again;
//! - a [`DeduplicationFilter`] remembers processed event ids for a TTL window, so a
//!   redelivered event that already succeeded is acknowledged without running handlers.
//!
//! Entries that can never succeed (no `payload` field, unparseable JSON, no handler for the
//! type) are acknowledged and dropped with a warning instead of being redelivered forever.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_stream::{
//!     ConsumerConfig, DedupConfig, DeduplicationFilter, HandlerRegistry, RedisDedupStore,
//!     RedisStreamTransport, StreamConsumer, TypedEvent,
//! };
//! use redis_utils::RedisPool;
//! use serde::Deserialize;
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! #[derive(Deserialize)]
//! struct LikeCreated {
//!     post_id: i64,
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = RedisPool::from_env().await?;
//! let transport = Arc::new(RedisStreamTransport::connect(&pool).await?);
//! let dedup = DeduplicationFilter::new(
//!     Arc::new(RedisDedupStore::from_pool(&pool)),
//!     DedupConfig::from_env()?,
//! )?;
//!
//! // Created -> GroupEnsured
//! let mut consumer = StreamConsumer::new(transport, dedup, ConsumerConfig::from_env()?).await?;
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register("LikeCreated", "like-counter", |event: TypedEvent<LikeCreated>| async move {
//!     println!("post {} liked", event.payload.post_id);
//!     Ok(())
//! })?;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     let _ = shutdown_tx.send(true);
//! });
//!
//! // HandlersDiscovered -> Consuming -> Stopped
//! consumer.start(registry, shutdown_rx).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consumer;
pub mod dedup;
pub mod error;
pub mod event;
pub mod handler;
pub mod memory;
pub mod metrics;
pub mod publisher;
pub mod transport;

pub use config::{ConsumerConfig, DedupConfig, PublisherConfig};
pub use consumer::{ConsumerState, EntryOutcome, StreamConsumer};
pub use dedup::{DedupStore, DeduplicationFilter, RedisDedupStore};
pub use error::{StreamError, StreamResult};
pub use event::{validate_event_id, IntegrationEvent, StreamEntry, PAYLOAD_FIELD};
pub use handler::{HandlerBinding, HandlerFuture, HandlerRegistry, TypedEvent};
pub use memory::{InMemoryDedupStore, InMemoryStreamTransport};
pub use metrics::ConsumerMetrics;
pub use publisher::StreamPublisher;
pub use transport::{GroupCreation, ReadCursor, RedisStreamTransport, StreamTransport};
