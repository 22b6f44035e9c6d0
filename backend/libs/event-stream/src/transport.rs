//! Consumer-group log access.

use crate::error::{StreamError, StreamResult};
use crate::event::StreamEntry;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamPendingReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use redis_utils::RedisPool;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// Where a group read starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadCursor {
    /// Never-delivered entries (`>`)
    New,
    /// This consumer's delivered but unacknowledged entries (`0`)
    Pending,
    /// This consumer's unacknowledged entries with ids after the given one
    PendingAfter(String),
}

impl ReadCursor {
    pub fn as_id(&self) -> &str {
        match self {
            Self::New => ">",
            Self::Pending => "0",
            Self::PendingAfter(id) => id,
        }
    }

    pub fn is_pending(&self) -> bool {
        !matches!(self, Self::New)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCreation {
    Created,
    AlreadyExists,
}

#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Create `group` at the start of `stream`, creating the stream if needed.
    async fn create_group(&self, stream: &str, group: &str) -> StreamResult<GroupCreation>;

    /// Read up to `count` entries. With `block`, waits at most that long and returns an empty
    /// batch on expiry.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> StreamResult<Vec<StreamEntry>>;

    /// Returns how many ids were still pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> StreamResult<u64>;

    async fn pending_count(&self, stream: &str, group: &str) -> StreamResult<u64>;

    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> StreamResult<String>;
}

/// Redis Streams transport.
///
/// Blocking reads go through their own connection; everything else shares the pool's
/// multiplexed manager.
#[derive(Clone)]
pub struct RedisStreamTransport {
    conn: ConnectionManager,
    blocking: ConnectionManager,
}

impl RedisStreamTransport {
    pub async fn connect(pool: &RedisPool) -> StreamResult<Self> {
        let blocking = pool.dedicated_connection().await?;
        Ok(Self {
            conn: pool.manager(),
            blocking,
        })
    }

    pub fn new(conn: ConnectionManager, blocking: ConnectionManager) -> Self {
        Self { conn, blocking }
    }
}

#[async_trait]
impl StreamTransport for RedisStreamTransport {
    async fn create_group(&self, stream: &str, group: &str) -> StreamResult<GroupCreation> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "0").await;
        match result {
            Ok(()) => Ok(GroupCreation::Created),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(GroupCreation::AlreadyExists),
            Err(e) => Err(StreamError::ConsumerGroup {
                stream: stream.to_string(),
                group: group.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> StreamResult<Vec<StreamEntry>> {
        let mut opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        let mut conn = match block {
            Some(timeout) => {
                opts = opts.block(timeout.as_millis().max(1) as usize);
                self.blocking.clone()
            }
            None => self.conn.clone(),
        };

        // Nil reply when the block timeout expires with nothing to deliver.
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[cursor.as_id()], &opts)
            .await?;

        let mut entries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for stream_id in key.ids {
                let mut fields = HashMap::with_capacity(stream_id.map.len());
                for (field, value) in &stream_id.map {
                    match redis::from_redis_value::<String>(value) {
                        Ok(text) => {
                            fields.insert(field.clone(), text);
                        }
                        Err(e) => {
                            warn!(
                                entry_id = %stream_id.id,
                                field = %field,
                                error = %e,
                                "Skipping non-string stream field"
                            );
                        }
                    }
                }
                entries.push(StreamEntry::new(stream_id.id, fields));
            }
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> StreamResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let acked: u64 = conn.xack(stream, group, ids).await?;
        Ok(acked)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> StreamResult<u64> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingReply = conn.xpending(stream, group).await?;
        Ok(reply.count() as u64)
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> StreamResult<String> {
        let mut conn = self.conn.clone();
        let id: String = match max_len {
            Some(len) => {
                conn.xadd_maxlen(stream, StreamMaxlen::Approx(len), "*", fields)
                    .await?
            }
            None => conn.xadd(stream, "*", fields).await?,
        };
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_ids() {
        assert_eq!(ReadCursor::New.as_id(), ">");
        assert_eq!(ReadCursor::Pending.as_id(), "0");
        assert_eq!(ReadCursor::PendingAfter("5-0".to_string()).as_id(), "5-0");
        assert!(ReadCursor::Pending.is_pending());
        assert!(!ReadCursor::New.is_pending());
    }
}
