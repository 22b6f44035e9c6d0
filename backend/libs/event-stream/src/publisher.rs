//! Producer side: append integration events to the stream.

use crate::config::PublisherConfig;
use crate::error::StreamResult;
use crate::event::IntegrationEvent;
use crate::transport::StreamTransport;
use std::sync::Arc;
use tracing::debug;

pub struct StreamPublisher<T: StreamTransport> {
    transport: Arc<T>,
    stream_key: String,
    max_len: Option<usize>,
}

impl<T: StreamTransport> StreamPublisher<T> {
    pub fn new(transport: Arc<T>, stream_key: impl Into<String>) -> Self {
        Self {
            transport,
            stream_key: stream_key.into(),
            max_len: None,
        }
    }

    pub fn from_config(transport: Arc<T>, config: PublisherConfig) -> Self {
        Self {
            transport,
            stream_key: config.stream_key,
            max_len: config.max_len,
        }
    }

    /// Trim to roughly `max_len` entries on every append (`MAXLEN ~`).
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Returns the id the log assigned to the entry.
    pub async fn publish(&self, event: &IntegrationEvent) -> StreamResult<String> {
        let fields = event.to_fields()?;
        let entry_id = self
            .transport
            .append(&self.stream_key, &fields, self.max_len)
            .await?;
        debug!(
            stream = %self.stream_key,
            entry_id = %entry_id,
            event_id = %event.event_id,
            event_type = %event.event_type,
            "Published integration event"
        );
        Ok(entry_id)
    }
}
