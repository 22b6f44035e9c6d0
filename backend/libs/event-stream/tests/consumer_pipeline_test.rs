//! End-to-end consumer behaviour over the in-memory transport.

use event_stream::{
    ConsumerConfig, DedupConfig, DeduplicationFilter, EntryOutcome, HandlerRegistry,
    InMemoryDedupStore, InMemoryStreamTransport, IntegrationEvent, ReadCursor, StreamConsumer,
    StreamError, StreamPublisher, StreamTransport, TypedEvent,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_test::{assert_err, assert_ok};

const STREAM: &str = "integration-events";
const GROUP: &str = "event-processors";
const CONSUMER: &str = "worker-1";

type Consumer = StreamConsumer<InMemoryStreamTransport, InMemoryDedupStore>;

fn config() -> ConsumerConfig {
    ConsumerConfig {
        stream_key: STREAM.to_string(),
        group_name: GROUP.to_string(),
        consumer_name: CONSUMER.to_string(),
        read_timeout: Duration::from_millis(20),
        batch_size: 10,
        pending_replay_interval: Duration::from_millis(50),
        error_backoff: Duration::from_millis(10),
    }
}

async fn consumer(transport: &Arc<InMemoryStreamTransport>) -> Consumer {
    let dedup =
        DeduplicationFilter::new(Arc::new(InMemoryDedupStore::new()), DedupConfig::default())
            .unwrap();
    StreamConsumer::new(Arc::clone(transport), dedup, config())
        .await
        .unwrap()
}

fn counting_registry(event_type: &str, calls: &Arc<AtomicUsize>) -> HandlerRegistry {
    let calls = Arc::clone(calls);
    let mut registry = HandlerRegistry::new();
    registry
        .register(event_type, "counter", move |_: TypedEvent<Value>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();
    registry
}

#[tokio::test]
async fn test_duplicate_event_id_dispatches_once() {
    let transport = Arc::new(InMemoryStreamTransport::new());
    let publisher = StreamPublisher::new(Arc::clone(&transport), STREAM);
    let mut consumer = consumer(&transport).await;

    let calls = Arc::new(AtomicUsize::new(0));
    consumer
        .discover_handlers(counting_registry("X", &calls))
        .unwrap();

    let event = IntegrationEvent::with_id("abc", "X", json!({}));
    assert_ok!(publisher.publish(&event).await);
    assert_eq!(assert_ok!(consumer.poll_once().await), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // At-least-once redelivery of the same event id before the TTL expires
    assert_ok!(publisher.publish(&event).await);
    assert_eq!(assert_ok!(consumer.poll_once().await), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(transport.pending_ids(STREAM, GROUP).await.is_empty());
    assert_eq!(consumer.pending_count().await, 0);
}

#[tokio::test]
async fn test_entry_without_payload_is_acked_not_dispatched() {
    let transport = Arc::new(InMemoryStreamTransport::new());
    let mut consumer = consumer(&transport).await;

    let calls = Arc::new(AtomicUsize::new(0));
    consumer
        .discover_handlers(counting_registry("X", &calls))
        .unwrap();

    assert_ok!(
        transport
            .append(STREAM, &[("body".to_string(), "{}".to_string())], None)
            .await
    );
    let entries = assert_ok!(
        transport
            .read_group(STREAM, GROUP, CONSUMER, ReadCursor::New, 10, None)
            .await
    );
    assert_eq!(entries.len(), 1);

    let outcome = assert_ok!(consumer.process_entry(&entries[0]).await);
    assert_eq!(outcome, EntryOutcome::MissingPayload);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(transport.pending_ids(STREAM, GROUP).await.is_empty());
}

#[tokio::test]
async fn test_failed_dispatch_stays_pending_with_same_id() {
    let transport = Arc::new(InMemoryStreamTransport::new());
    let publisher = StreamPublisher::new(Arc::clone(&transport), STREAM);
    let mut consumer = consumer(&transport).await;

    let mut registry = HandlerRegistry::new();
    registry
        .register("X", "always-fails", |_: TypedEvent<Value>| async {
            Err(anyhow::anyhow!("projection store offline"))
        })
        .unwrap();
    consumer.discover_handlers(registry).unwrap();

    let entry_id = assert_ok!(
        publisher
            .publish(&IntegrationEvent::with_id("e1", "X", json!({})))
            .await
    );
    let entries = assert_ok!(
        transport
            .read_group(STREAM, GROUP, CONSUMER, ReadCursor::New, 10, None)
            .await
    );
    let err = assert_err!(consumer.process_entry(&entries[0]).await);
    assert!(matches!(err, StreamError::Handler { .. }));

    let pending = assert_ok!(
        transport
            .read_group(STREAM, GROUP, CONSUMER, ReadCursor::Pending, 10, None)
            .await
    );
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, entry_id);
    assert_eq!(consumer.pending_count().await, 1);
}

#[tokio::test]
async fn test_replay_redelivers_after_handler_recovers() {
    let transport = Arc::new(InMemoryStreamTransport::new());
    let publisher = StreamPublisher::new(Arc::clone(&transport), STREAM);
    let mut consumer = consumer(&transport).await;

    let healthy = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let (flag, counter) = (Arc::clone(&healthy), Arc::clone(&calls));
    let mut registry = HandlerRegistry::new();
    registry
        .register("X", "flaky", move |_: TypedEvent<Value>| {
            let healthy = flag.load(Ordering::SeqCst);
            let counter = Arc::clone(&counter);
            async move {
                if !healthy {
                    anyhow::bail!("not ready");
                }
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();
    consumer.discover_handlers(registry).unwrap();

    assert_ok!(
        publisher
            .publish(&IntegrationEvent::with_id("e1", "X", json!({})))
            .await
    );
    assert_eq!(assert_ok!(consumer.poll_once().await), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(transport.pending_ids(STREAM, GROUP).await.len(), 1);

    healthy.store(true, Ordering::SeqCst);
    assert_eq!(assert_ok!(consumer.replay_pending().await), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(transport.pending_ids(STREAM, GROUP).await.is_empty());
}

#[tokio::test]
async fn test_replay_pages_past_entries_that_keep_failing() {
    let transport = Arc::new(InMemoryStreamTransport::new());
    let publisher = StreamPublisher::new(Arc::clone(&transport), STREAM);
    let dedup =
        DeduplicationFilter::new(Arc::new(InMemoryDedupStore::new()), DedupConfig::default())
            .unwrap();
    let single_entry_pages = ConsumerConfig {
        batch_size: 1,
        ..config()
    };
    let mut consumer = StreamConsumer::new(Arc::clone(&transport), dedup, single_entry_pages)
        .await
        .unwrap();

    let healthy = Arc::new(AtomicBool::new(false));
    let recovered_calls = Arc::new(AtomicUsize::new(0));
    let (flag, counter) = (Arc::clone(&healthy), Arc::clone(&recovered_calls));
    let mut registry = HandlerRegistry::new();
    registry
        .register("X", "projector", move |event: TypedEvent<Value>| {
            let healthy = flag.load(Ordering::SeqCst);
            let counter = Arc::clone(&counter);
            async move {
                if event.event_id == "poison" {
                    anyhow::bail!("cannot project poison");
                }
                if !healthy {
                    anyhow::bail!("not ready");
                }
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();
    consumer.discover_handlers(registry).unwrap();

    let poison_id = assert_ok!(
        publisher
            .publish(&IntegrationEvent::with_id("poison", "X", json!({})))
            .await
    );
    assert_ok!(
        publisher
            .publish(&IntegrationEvent::with_id("e2", "X", json!({})))
            .await
    );
    assert_eq!(assert_ok!(consumer.poll_once().await), 1);
    assert_eq!(assert_ok!(consumer.poll_once().await), 1);
    assert_eq!(transport.pending_ids(STREAM, GROUP).await.len(), 2);

    healthy.store(true, Ordering::SeqCst);
    assert_eq!(assert_ok!(consumer.replay_pending().await), 2);
    assert_eq!(recovered_calls.load(Ordering::SeqCst), 1);
    assert_eq!(transport.pending_ids(STREAM, GROUP).await, vec![poison_id]);
}

#[tokio::test]
async fn test_run_loop_processes_until_shutdown() {
    let transport = Arc::new(InMemoryStreamTransport::new());
    let publisher = StreamPublisher::new(Arc::clone(&transport), STREAM);
    let mut consumer = consumer(&transport).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let registry = counting_registry("X", &calls);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = tokio::spawn(async move {
        let result = consumer.start(registry, shutdown_rx).await;
        (consumer, result)
    });

    for i in 0..5 {
        let event = IntegrationEvent::with_id(format!("e{i}"), "X", json!({"i": i}));
        assert_ok!(publisher.publish(&event).await);
    }

    for _ in 0..100 {
        if calls.load(Ordering::SeqCst) == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    shutdown_tx.send(true).unwrap();
    let (consumer, result) = tokio::time::timeout(Duration::from_secs(2), worker)
        .await
        .expect("consumer did not stop")
        .unwrap();
    assert_ok!(result);
    assert_eq!(consumer.state(), event_stream::ConsumerState::Stopped);
    assert!(transport.pending_ids(STREAM, GROUP).await.is_empty());
}

#[tokio::test]
async fn test_two_consumers_share_the_group() {
    let transport = Arc::new(InMemoryStreamTransport::new());
    let publisher = StreamPublisher::new(Arc::clone(&transport), STREAM);

    let calls = Arc::new(AtomicUsize::new(0));
    let mut first = consumer(&transport).await;
    first.discover_handlers(counting_registry("X", &calls)).unwrap();

    let dedup =
        DeduplicationFilter::new(Arc::new(InMemoryDedupStore::new()), DedupConfig::default())
            .unwrap();
    let second_config = ConsumerConfig {
        consumer_name: "worker-2".to_string(),
        batch_size: 1,
        ..config()
    };
    let mut second = StreamConsumer::new(Arc::clone(&transport), dedup, second_config)
        .await
        .unwrap();
    second
        .discover_handlers(counting_registry("X", &calls))
        .unwrap();

    for i in 0..3 {
        let event = IntegrationEvent::with_id(format!("e{i}"), "X", Value::Null);
        assert_ok!(publisher.publish(&event).await);
    }

    let read_by_second = assert_ok!(second.poll_once().await);
    let read_by_first = assert_ok!(first.poll_once().await);
    assert_eq!(read_by_second, 1);
    assert_eq!(read_by_first, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}
