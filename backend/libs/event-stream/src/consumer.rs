//! Consumer-group reader with idempotent dispatch.
//!
//! Lifecycle: `Created -> GroupEnsured -> HandlersDiscovered -> Consuming -> Stopped`.
//!
//! Per entry:
//! 1. no `payload` field: acknowledge and drop
//! 2. payload does not parse: acknowledge and drop
//! 3. event id already processed: acknowledge and skip
//! 4. no handler for the event type: acknowledge and drop
//! 5. dispatch to every binding in order; any failure leaves the entry pending and releases
//!    the dedup mark so the redelivery is dispatched again
//! 6. acknowledge
//!
//! Shutdown is cooperative. The signal is only observed while waiting on a read, so a batch
//! that has been read is always fully processed first.

use crate::config::ConsumerConfig;
use crate::dedup::{DedupStore, DeduplicationFilter};
use crate::error::{StreamError, StreamResult};
use crate::event::{IntegrationEvent, StreamEntry};
use crate::handler::{HandlerBinding, HandlerRegistry};
use crate::metrics::ConsumerMetrics;
use crate::transport::{GroupCreation, ReadCursor, StreamTransport};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    GroupEnsured,
    HandlersDiscovered,
    Consuming,
    Stopped,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::GroupEnsured => "group_ensured",
            Self::HandlersDiscovered => "handlers_discovered",
            Self::Consuming => "consuming",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// How an entry left the pipeline. Every variant means the entry was acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    Dispatched { handlers: usize },
    Duplicate,
    MissingPayload,
    Malformed,
    Unhandled,
}

impl EntryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatched { .. } => "dispatched",
            Self::Duplicate => "duplicate",
            Self::MissingPayload => "missing_payload",
            Self::Malformed => "malformed",
            Self::Unhandled => "unhandled",
        }
    }
}

pub struct StreamConsumer<T: StreamTransport, D: DedupStore> {
    transport: Arc<T>,
    dedup: DeduplicationFilter<D>,
    config: ConsumerConfig,
    handlers: HashMap<String, Vec<HandlerBinding>>,
    state: ConsumerState,
    metrics: Option<ConsumerMetrics>,
}

impl<T: StreamTransport, D: DedupStore> StreamConsumer<T, D> {
    /// Validate the configuration and ensure the consumer group exists.
    pub async fn new(
        transport: Arc<T>,
        dedup: DeduplicationFilter<D>,
        config: ConsumerConfig,
    ) -> StreamResult<Self> {
        config.validate()?;
        let mut consumer = Self {
            transport,
            dedup,
            config,
            handlers: HashMap::new(),
            state: ConsumerState::Created,
            metrics: None,
        };
        consumer.ensure_group().await?;
        Ok(consumer)
    }

    pub fn with_metrics(mut self, metrics: ConsumerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn ensure_group(&mut self) -> StreamResult<()> {
        let stream = &self.config.stream_key;
        let group = &self.config.group_name;
        match self.transport.create_group(stream, group).await? {
            GroupCreation::Created => {
                info!(stream = %stream, group = %group, "Created consumer group");
            }
            GroupCreation::AlreadyExists => {
                debug!(stream = %stream, group = %group, "Consumer group already exists");
            }
        }
        self.state = ConsumerState::GroupEnsured;
        Ok(())
    }

    /// Take the application's handler table. Called once, after every handler owner exists.
    pub fn discover_handlers(&mut self, registry: HandlerRegistry) -> StreamResult<()> {
        if self.state != ConsumerState::GroupEnsured {
            return Err(StreamError::InvalidState(format!(
                "handlers can only be discovered once, consumer is {}",
                self.state
            )));
        }
        let event_types = registry.event_type_count();
        let handlers = registry.handler_count();
        self.handlers = registry.into_bindings();
        self.state = ConsumerState::HandlersDiscovered;
        info!(event_types, handlers, "Discovered event handlers");
        Ok(())
    }

    /// Discover handlers, then consume until `shutdown` flips to `true`.
    pub async fn start(
        &mut self,
        registry: HandlerRegistry,
        shutdown: watch::Receiver<bool>,
    ) -> StreamResult<()> {
        self.discover_handlers(registry)?;
        self.run(shutdown).await
    }

    /// Consume until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> StreamResult<()> {
        if self.state != ConsumerState::HandlersDiscovered {
            return Err(StreamError::InvalidState(format!(
                "consumer must discover handlers before running, consumer is {}",
                self.state
            )));
        }
        self.state = ConsumerState::Consuming;
        info!(
            stream = %self.config.stream_key,
            group = %self.config.group_name,
            consumer = %self.config.consumer_name,
            "Starting stream consumer loop"
        );

        self.replay_logged().await;
        let mut last_replay = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }
            if last_replay.elapsed() >= self.config.pending_replay_interval {
                self.replay_logged().await;
                last_replay = Instant::now();
            }

            let read = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                read = self.read(ReadCursor::New) => read,
            };

            match read {
                Ok(entries) => self.process_batch(&entries).await,
                Err(e) => {
                    error!(
                        stream = %self.config.stream_key,
                        error = %e,
                        "Stream read failed"
                    );
                    tokio::time::sleep(self.config.error_backoff).await;
                }
            }
        }

        self.state = ConsumerState::Stopped;
        info!(
            consumer = %self.config.consumer_name,
            "Shutdown signal received, stream consumer stopped"
        );
        Ok(())
    }

    /// One blocking read of new entries, fully processed. Returns how many were read.
    pub async fn poll_once(&self) -> StreamResult<usize> {
        let entries = self.read(ReadCursor::New).await?;
        self.process_batch(&entries).await;
        Ok(entries.len())
    }

    /// Re-read and process every unacknowledged entry this consumer holds, one page of
    /// `batch_size` at a time. Entries that fail again do not block the ones after them.
    /// Returns how many were read.
    pub async fn replay_pending(&self) -> StreamResult<usize> {
        let mut cursor = ReadCursor::Pending;
        let mut replayed = 0;
        loop {
            let entries = self.read(cursor).await?;
            let Some(last) = entries.last() else {
                break;
            };
            cursor = ReadCursor::PendingAfter(last.id.clone());
            self.process_batch(&entries).await;
            replayed += entries.len();
            if entries.len() < self.config.batch_size {
                break;
            }
        }

        if replayed > 0 {
            info!(
                consumer = %self.config.consumer_name,
                count = replayed,
                "Replayed pending entries"
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.pending_entries.set(self.pending_count().await as i64);
        }
        Ok(replayed)
    }

    async fn replay_logged(&self) {
        if let Err(e) = self.replay_pending().await {
            warn!(error = %e, "Pending entry replay failed");
        }
    }

    async fn read(&self, cursor: ReadCursor) -> StreamResult<Vec<StreamEntry>> {
        let block = if cursor.is_pending() {
            None
        } else {
            Some(self.config.read_timeout)
        };
        self.transport
            .read_group(
                &self.config.stream_key,
                &self.config.group_name,
                &self.config.consumer_name,
                cursor,
                self.config.batch_size,
                block,
            )
            .await
    }

    async fn process_batch(&self, entries: &[StreamEntry]) {
        for entry in entries {
            match self.process_entry(entry).await {
                Ok(outcome) => self.record(outcome.as_str()),
                Err(e) => {
                    self.record("failed");
                    error!(
                        entry_id = %entry.id,
                        error = %e,
                        "Failed to process stream entry; leaving it pending"
                    );
                }
            }
        }
    }

    fn record(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.messages.with_label_values(&[outcome]).inc();
        }
    }

    /// Run one entry through the pipeline. `Ok` means the entry was acknowledged.
    pub async fn process_entry(&self, entry: &StreamEntry) -> StreamResult<EntryOutcome> {
        let Some(raw) = entry.payload() else {
            warn!(entry_id = %entry.id, "Stream entry has no payload field; dropping");
            self.ack(&entry.id).await?;
            return Ok(EntryOutcome::MissingPayload);
        };

        let event = match IntegrationEvent::from_json(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "Malformed event payload; dropping");
                self.ack(&entry.id).await?;
                return Ok(EntryOutcome::Malformed);
            }
        };

        if self.dedup.is_duplicate(&event.event_id).await {
            debug!(
                entry_id = %entry.id,
                event_id = %event.event_id,
                "Duplicate event; acknowledging without dispatch"
            );
            self.ack(&entry.id).await?;
            return Ok(EntryOutcome::Duplicate);
        }

        let bindings = self
            .handlers
            .get(&event.event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        if bindings.is_empty() {
            warn!(
                entry_id = %entry.id,
                event_type = %event.event_type,
                "No handler registered for event type; dropping"
            );
            self.ack(&entry.id).await?;
            return Ok(EntryOutcome::Unhandled);
        }

        if let Err(e) = self.dispatch(&event, bindings).await {
            if let Some(metrics) = &self.metrics {
                metrics
                    .handler_failures
                    .with_label_values(&[event.event_type.as_str()])
                    .inc();
            }
            if let Err(release_error) = self.dedup.release(&event.event_id).await {
                warn!(
                    event_id = %event.event_id,
                    error = %release_error,
                    "Failed to release deduplication mark; redelivery will be skipped"
                );
            }
            return Err(e);
        }

        self.ack(&entry.id).await?;
        Ok(EntryOutcome::Dispatched {
            handlers: bindings.len(),
        })
    }

    async fn dispatch(&self, event: &IntegrationEvent, bindings: &[HandlerBinding]) -> StreamResult<()> {
        let started = Instant::now();
        for binding in bindings {
            binding.invoke(event).await.map_err(|source| StreamError::Handler {
                owner: binding.owner().to_string(),
                event_type: event.event_type.clone(),
                event_id: event.event_id.clone(),
                source,
            })?;
        }
        if let Some(metrics) = &self.metrics {
            metrics
                .dispatch_duration_seconds
                .with_label_values(&[event.event_type.as_str()])
                .observe(started.elapsed().as_secs_f64());
        }
        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            handlers = bindings.len(),
            "Dispatched event"
        );
        Ok(())
    }

    async fn ack(&self, entry_id: &str) -> StreamResult<()> {
        let acked = self
            .transport
            .ack(
                &self.config.stream_key,
                &self.config.group_name,
                &[entry_id.to_string()],
            )
            .await?;
        if acked == 0 {
            warn!(entry_id = %entry_id, "Entry was already acknowledged");
        }
        Ok(())
    }

    /// Entries pending for the whole group. `0` on error.
    pub async fn pending_count(&self) -> u64 {
        match self
            .transport
            .pending_count(&self.config.stream_key, &self.config.group_name)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Failed to read pending entry count");
                0
            }
        }
    }

    pub fn handler_type_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn dedup(&self) -> &DeduplicationFilter<D> {
        &self.dedup
    }
}
