//! In-process stream transport and dedup store.
//!
//! The transport keeps the consumer-group rules that matter to delivery: each new entry goes
//! to exactly one consumer of a group, stays pending until acknowledged, and is returned
//! again by a pending read (cursor `0`) for the consumer that holds it.

use crate::dedup::DedupStore;
use crate::error::{StreamError, StreamResult};
use crate::event::StreamEntry;
use crate::transport::{GroupCreation, ReadCursor, StreamTransport};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

#[derive(Debug, Default)]
struct Group {
    last_delivered: u64,
    /// seq -> owning consumer
    pending: BTreeMap<u64, String>,
}

#[derive(Debug, Default)]
struct Log {
    entries: VecDeque<(u64, HashMap<String, String>)>,
    next_seq: u64,
    groups: HashMap<String, Group>,
}

fn entry_id(seq: u64) -> String {
    format!("{}-0", seq)
}

fn parse_seq(id: &str) -> Option<u64> {
    id.split('-').next()?.parse().ok()
}

#[derive(Clone, Default)]
pub struct InMemoryStreamTransport {
    streams: Arc<Mutex<HashMap<String, Log>>>,
    appended: Arc<Notify>,
}

impl InMemoryStreamTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending entry ids for `group`, oldest first.
    pub async fn pending_ids(&self, stream: &str, group: &str) -> Vec<String> {
        let streams = self.streams.lock().await;
        streams
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .map(|g| g.pending.keys().map(|seq| entry_id(*seq)).collect())
            .unwrap_or_default()
    }

    pub async fn stream_len(&self, stream: &str) -> usize {
        let streams = self.streams.lock().await;
        streams.get(stream).map(|log| log.entries.len()).unwrap_or(0)
    }

    async fn try_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: &ReadCursor,
        count: usize,
    ) -> StreamResult<Vec<StreamEntry>> {
        let mut streams = self.streams.lock().await;
        let log = streams.get_mut(stream).ok_or_else(|| no_group(stream, group))?;
        let Log {
            entries, groups, ..
        } = log;
        let state = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

        match cursor {
            ReadCursor::New => {
                let batch: Vec<(u64, HashMap<String, String>)> = entries
                    .iter()
                    .filter(|(seq, _)| *seq > state.last_delivered)
                    .take(count)
                    .cloned()
                    .collect();
                if let Some((last, _)) = batch.last() {
                    state.last_delivered = *last;
                }
                for (seq, _) in &batch {
                    state.pending.insert(*seq, consumer.to_string());
                }
                Ok(batch
                    .into_iter()
                    .map(|(seq, fields)| StreamEntry::new(entry_id(seq), fields))
                    .collect())
            }
            ReadCursor::Pending | ReadCursor::PendingAfter(_) => {
                let after = parse_seq(cursor.as_id()).unwrap_or(0);
                let owned: Vec<u64> = state
                    .pending
                    .range(after.saturating_add(1)..)
                    .filter(|(_, owner)| owner.as_str() == consumer)
                    .map(|(seq, _)| *seq)
                    .take(count)
                    .collect();
                // Trimmed entries come back with no fields, as XREADGROUP reports them.
                Ok(owned
                    .into_iter()
                    .map(|seq| {
                        let fields = entries
                            .iter()
                            .find(|(s, _)| *s == seq)
                            .map(|(_, f)| f.clone())
                            .unwrap_or_default();
                        StreamEntry::new(entry_id(seq), fields)
                    })
                    .collect())
            }
        }
    }
}

fn no_group(stream: &str, group: &str) -> StreamError {
    StreamError::Transport(format!(
        "NOGROUP no such key '{}' or consumer group '{}'",
        stream, group
    ))
}

#[async_trait]
impl StreamTransport for InMemoryStreamTransport {
    async fn create_group(&self, stream: &str, group: &str) -> StreamResult<GroupCreation> {
        let mut streams = self.streams.lock().await;
        let log = streams.entry(stream.to_string()).or_default();
        if log.groups.contains_key(group) {
            return Ok(GroupCreation::AlreadyExists);
        }
        log.groups.insert(group.to_string(), Group::default());
        Ok(GroupCreation::Created)
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
        let deadline = block.map(|b| Instant::now() + b);
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.try_read(stream, group, consumer, &cursor, count).await?;
            if !batch.is_empty() || cursor.is_pending() {
                return Ok(batch);
            }
            let Some(deadline) = deadline else {
                return Ok(batch);
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> StreamResult<u64> {
        let mut streams = self.streams.lock().await;
        let Some(state) = streams.get_mut(stream).and_then(|log| log.groups.get_mut(group)) else {
            return Ok(0);
        };
        let acked = ids
            .iter()
            .filter_map(|id| parse_seq(id))
            .filter(|seq| state.pending.remove(seq).is_some())
            .count();
        Ok(acked as u64)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> StreamResult<u64> {
        let streams = self.streams.lock().await;
        let state = streams
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .ok_or_else(|| no_group(stream, group))?;
        Ok(state.pending.len() as u64)
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> StreamResult<String> {
        let id = {
            let mut streams = self.streams.lock().await;
            let log = streams.entry(stream.to_string()).or_default();
            log.next_seq += 1;
            let seq = log.next_seq;
            log.entries
                .push_back((seq, fields.iter().cloned().collect()));
            if let Some(max_len) = max_len {
                while log.entries.len() > max_len {
                    log.entries.pop_front();
                }
            }
            entry_id(seq)
        };
        self.appended.notify_waiters();
        Ok(id)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryDedupStore {
    sets: Arc<Mutex<HashMap<String, DedupSet>>>,
}

/// Minimum gap between full sweeps of one dedup set.
pub const DEDUP_SWEEP_INTERVAL_MS: u64 = 60_000;

#[derive(Default)]
struct DedupSet {
    /// event id -> expiry ms
    expiries: HashMap<String, u64>,
    swept_at_ms: u64,
}

impl DedupSet {
    fn sweep_if_due(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.swept_at_ms) < DEDUP_SWEEP_INTERVAL_MS {
            return;
        }
        self.expiries.retain(|_, expires_at| *expires_at > now_ms);
        self.swept_at_ms = now_ms;
    }

    fn is_live(&self, event_id: &str, now_ms: u64) -> bool {
        self.expiries
            .get(event_id)
            .is_some_and(|expires_at| *expires_at > now_ms)
    }
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn insert_if_absent(
        &self,
        set_key: &str,
        event_id: &str,
        now_ms: u64,
        ttl_ms: u64,
    ) -> StreamResult<bool> {
        let mut sets = self.sets.lock().await;
        let set = sets.entry(set_key.to_string()).or_default();
        set.sweep_if_due(now_ms);
        if set.is_live(event_id, now_ms) {
            return Ok(false);
        }
        set.expiries
            .insert(event_id.to_string(), now_ms.saturating_add(ttl_ms));
        Ok(true)
    }

    async fn remove(&self, set_key: &str, event_id: &str) -> StreamResult<bool> {
        let mut sets = self.sets.lock().await;
        Ok(sets
            .get_mut(set_key)
            .map(|set| set.expiries.remove(event_id).is_some())
            .unwrap_or(false))
    }

    async fn live_count(&self, set_key: &str, now_ms: u64) -> StreamResult<u64> {
        let sets = self.sets.lock().await;
        Ok(sets
            .get(set_key)
            .map(|set| {
                set.expiries
                    .values()
                    .filter(|expires_at| **expires_at > now_ms)
                    .count()
            })
            .unwrap_or(0) as u64)
    }
}
