//! Wire model: integration events carried in a single stream entry field.

use crate::error::{StreamError, StreamResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Entry field holding the JSON-serialized [`IntegrationEvent`].
pub const PAYLOAD_FIELD: &str = "payload";

const MAX_EVENT_ID_LEN: usize = 255;

/// One log entry as delivered by the stream. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn new(id: impl Into<String>, fields: HashMap<String, String>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn payload(&self) -> Option<&str> {
        self.fields.get(PAYLOAD_FIELD).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationEvent {
    pub event_id: String,
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl IntegrationEvent {
    /// New event with a random id, stamped now.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), event_type, payload)
    }

    /// Event with a caller-chosen id, e.g. a deterministic id for a retried command.
    pub fn with_id(event_id: impl Into<String>, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            payload,
            occurred_at: Some(Utc::now()),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> StreamResult<()> {
        validate_event_id(&self.event_id)?;
        if self.event_type.trim().is_empty() {
            return Err(StreamError::InvalidEvent(
                "eventType must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate the `payload` field of an entry.
    pub fn from_json(raw: &str) -> StreamResult<Self> {
        let event: Self = serde_json::from_str(raw)?;
        event.validate()?;
        Ok(event)
    }

    /// Fields for `XADD`.
    pub fn to_fields(&self) -> StreamResult<Vec<(String, String)>> {
        self.validate()?;
        Ok(vec![(
            PAYLOAD_FIELD.to_string(),
            serde_json::to_string(self)?,
        )])
    }
}

/// Event ids are dedup keys: non-empty and bounded.
pub fn validate_event_id(event_id: &str) -> StreamResult<()> {
    if event_id.trim().is_empty() {
        return Err(StreamError::InvalidEvent(
            "eventId must not be empty".to_string(),
        ));
    }
    if event_id.len() > MAX_EVENT_ID_LEN {
        return Err(StreamError::InvalidEvent(format!(
            "eventId exceeds {} bytes",
            MAX_EVENT_ID_LEN
        )));
    }
    Ok(())
}
