//! In-memory stream backend
//!
//! Single-process implementation of the broker contract:
//! - Append-only `VecDeque` log per stream with `<ms>-<seq>` ids
//! - Group-level delivery cursor, so each message reaches exactly one
//!   consumer per group
//! - Pending lists with idle tracking for ack/claim recovery
//! - `tokio::sync::Notify` wakeups for blocking reads (no polling)
//!
//! ## Limitations
//!
//! This backend is the reduced-durability profile: process crash loses all
//! messages, and there is no cross-process delivery. Production deployments
//! use the Redis backend.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Notify;

use super::backend::{
    GroupStart, MessageBody, PendingSummary, StreamBackend, StreamEntry, StreamStats,
};
use super::error::BrokerError;
use crate::core::constants::DEFAULT_STREAM_MAXLEN;

type EntryId = (i64, u64);

fn format_id(id: EntryId) -> String {
    format!("{}-{}", id.0, id.1)
}

fn parse_id(id: &str) -> Result<EntryId, BrokerError> {
    let mut parts = id.splitn(2, '-');
    let ms = parts.next().and_then(|p| p.parse().ok());
    let seq = parts.next().and_then(|p| p.parse().ok());
    match (ms, seq) {
        (Some(ms), Some(seq)) => Ok((ms, seq)),
        _ => Err(BrokerError::Stream(format!("invalid message id: {}", id))),
    }
}

/// Message stored in a memory stream
#[derive(Clone)]
struct StoredEntry {
    id: EntryId,
    body: MessageBody,
}

impl StoredEntry {
    fn to_stream_entry(&self) -> StreamEntry {
        StreamEntry {
            id: format_id(self.id),
            body: self.body.clone(),
        }
    }
}

/// Pending bookkeeping: who holds the message and since when
struct PendingInfo {
    consumer: String,
    delivered_at: Instant,
}

/// Consumer group state for a stream
#[derive(Default)]
struct GroupState {
    /// Group delivery cursor: highest id handed to any consumer
    last_delivered: EntryId,
    /// message id -> pending info
    pending: BTreeMap<EntryId, PendingInfo>,
    /// Consumers ever seen in this group
    consumers: HashSet<String>,
}

/// Stream state
struct StreamState {
    entries: VecDeque<StoredEntry>,
    groups: HashMap<String, GroupState>,
    last_id: EntryId,
    max_len: u64,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            groups: HashMap::new(),
            last_id: (0, 0),
            max_len: DEFAULT_STREAM_MAXLEN,
        }
    }
}

impl StreamState {
    /// Drop oldest entries past `max_len`, cleaning pending references
    fn trim_to_max(&mut self) -> u64 {
        let mut removed = 0;
        while self.entries.len() as u64 > self.max_len {
            if let Some(entry) = self.entries.pop_front() {
                for group in self.groups.values_mut() {
                    group.pending.remove(&entry.id);
                }
                removed += 1;
            }
        }
        removed
    }
}

struct SharedState {
    streams: RwLock<HashMap<String, StreamState>>,
    notifiers: RwLock<HashMap<String, Arc<Notify>>>,
}

/// In-memory stream backend
pub struct MemoryBackend {
    state: Arc<SharedState>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SharedState {
                streams: RwLock::new(HashMap::new()),
                notifiers: RwLock::new(HashMap::new()),
            }),
        }
    }

    fn notifier(&self, stream: &str) -> Arc<Notify> {
        {
            let notifiers = self.state.notifiers.read();
            if let Some(n) = notifiers.get(stream) {
                return Arc::clone(n);
            }
        }
        let mut notifiers = self.state.notifiers.write();
        Arc::clone(
            notifiers
                .entry(stream.to_string())
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }

    /// Non-blocking delivery attempt for `read_group`
    fn try_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut streams = self.state.streams.write();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::ConsumerGroup(format!("no such stream: {}", stream)))?;

        // Find deliverable entries before taking the group borrow mutable
        let cursor = state
            .groups
            .get(group)
            .ok_or_else(|| {
                BrokerError::ConsumerGroup(format!("no group {} on stream {}", group, stream))
            })?
            .last_delivered;

        let batch: Vec<StoredEntry> = state
            .entries
            .iter()
            .filter(|e| e.id > cursor)
            .take(count)
            .cloned()
            .collect();

        let group_state = state
            .groups
            .get_mut(group)
            .expect("group checked above");
        group_state.consumers.insert(consumer.to_string());

        let now = Instant::now();
        let mut delivered = Vec::with_capacity(batch.len());
        for entry in batch {
            group_state.pending.insert(
                entry.id,
                PendingInfo {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                },
            );
            group_state.last_delivered = entry.id;
            delivered.push(entry.to_stream_entry());
        }
        Ok(delivered)
    }

    /// Transfer the given pending ids to `new_consumer` when idle enough
    fn transfer_pending(
        state: &mut StreamState,
        group: &str,
        new_consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Vec<StreamEntry> {
        let now = Instant::now();
        let Some(group_state) = state.groups.get_mut(group) else {
            return Vec::new();
        };
        group_state.consumers.insert(new_consumer.to_string());

        let mut claimed_ids = Vec::new();
        for id in ids {
            if let Some(info) = group_state.pending.get_mut(id)
                && now.duration_since(info.delivered_at) >= min_idle
            {
                info.consumer = new_consumer.to_string();
                info.delivered_at = now;
                claimed_ids.push(*id);
            }
        }

        // Resolve payloads; pending entries whose message was trimmed away
        // are dropped from the pending list (nothing left to deliver).
        let mut claimed = Vec::new();
        for id in claimed_ids {
            match state.entries.iter().find(|e| e.id == id) {
                Some(entry) => claimed.push(entry.to_stream_entry()),
                None => {
                    if let Some(gs) = state.groups.get_mut(group) {
                        gs.pending.remove(&id);
                    }
                }
            }
        }
        claimed
    }
}

#[async_trait]
impl StreamBackend for MemoryBackend {
    async fn publish(&self, stream: &str, body: MessageBody) -> Result<String, BrokerError> {
        let id = {
            let mut streams = self.state.streams.write();
            let state = streams.entry(stream.to_string()).or_default();

            let now_ms = chrono::Utc::now().timestamp_millis();
            let id = if now_ms > state.last_id.0 {
                (now_ms, 0)
            } else {
                (state.last_id.0, state.last_id.1 + 1)
            };
            state.last_id = id;
            state.entries.push_back(StoredEntry {
                id,
                body,
            });
            state.trim_to_max();
            id
        };

        self.notifier(stream).notify_waiters();
        Ok(format_id(id))
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<(), BrokerError> {
        let mut streams = self.state.streams.write();
        let state = streams.entry(stream.to_string()).or_default();
        let last_id = state.last_id;
        state.groups.entry(group.to_string()).or_insert_with(|| GroupState {
            last_delivered: match start {
                GroupStart::Latest => last_id,
                GroupStart::Earliest => (0, 0),
            },
            ..Default::default()
        });
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        let notifier = self.notifier(stream);

        loop {
            let batch = self.try_read(stream, group, consumer, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            // Lost wakeups self-heal at the deadline
            let _ = tokio::time::timeout(deadline - now, notifier.notified()).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, BrokerError> {
        let mut streams = self.state.streams.write();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::Stream(format!("stream not found: {}", stream)))?;
        let group_state = state.groups.get_mut(group).ok_or_else(|| {
            BrokerError::ConsumerGroup(format!("consumer group not found: {}", group))
        })?;

        let mut removed = 0;
        for id in ids {
            if group_state.pending.remove(&parse_id(id)?).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<PendingSummary, BrokerError> {
        let streams = self.state.streams.read();
        let Some(state) = streams.get(stream) else {
            return Ok(PendingSummary::default());
        };
        let Some(group_state) = state.groups.get(group) else {
            return Ok(PendingSummary::default());
        };

        let now = Instant::now();
        let mut per_consumer: HashMap<String, u64> = HashMap::new();
        let mut oldest_idle_ms = None;
        for info in group_state.pending.values() {
            *per_consumer.entry(info.consumer.clone()).or_default() += 1;
            let idle = now.duration_since(info.delivered_at).as_millis() as u64;
            if oldest_idle_ms.is_none_or(|cur| idle > cur) {
                oldest_idle_ms = Some(idle);
            }
        }

        Ok(PendingSummary {
            total: group_state.pending.len() as u64,
            per_consumer,
            oldest_idle_ms,
        })
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let parsed: Vec<EntryId> = ids.iter().map(|id| parse_id(id)).collect::<Result<_, _>>()?;

        let mut streams = self.state.streams.write();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        Ok(Self::transfer_pending(
            state,
            group,
            new_consumer,
            Duration::from_millis(min_idle_ms),
            &parsed,
        ))
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let min_idle = Duration::from_millis(min_idle_ms);
        let mut streams = self.state.streams.write();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let stale: Vec<EntryId> = match state.groups.get(group) {
            Some(gs) => gs
                .pending
                .iter()
                .filter(|(_, info)| now.duration_since(info.delivered_at) >= min_idle)
                .map(|(&id, _)| id)
                .take(count)
                .collect(),
            None => return Ok(Vec::new()),
        };

        Ok(Self::transfer_pending(state, group, new_consumer, min_idle, &stale))
    }

    async fn trim(&self, stream: &str, max_len: u64) -> Result<u64, BrokerError> {
        let mut streams = self.state.streams.write();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(0);
        };
        state.max_len = max_len;
        Ok(state.trim_to_max())
    }

    async fn range(
        &self,
        stream: &str,
        start_ms: i64,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let streams = self.state.streams.read();
        let Some(state) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        Ok(state
            .entries
            .iter()
            .filter(|e| e.id.0 >= start_ms)
            .take(count)
            .map(StoredEntry::to_stream_entry)
            .collect())
    }

    async fn last_entry(&self, stream: &str) -> Result<Option<StreamEntry>, BrokerError> {
        let streams = self.state.streams.read();
        Ok(streams
            .get(stream)
            .and_then(|s| s.entries.back())
            .map(StoredEntry::to_stream_entry))
    }

    async fn count_since(&self, stream: &str, since_ms: i64) -> Result<u64, BrokerError> {
        let streams = self.state.streams.read();
        let Some(state) = streams.get(stream) else {
            return Ok(0);
        };
        // Entries are id-ordered; count from the newest end
        Ok(state
            .entries
            .iter()
            .rev()
            .take_while(|e| e.id.0 >= since_ms)
            .count() as u64)
    }

    async fn stats(&self, stream: &str, group: &str) -> Result<StreamStats, BrokerError> {
        let length = {
            let streams = self.state.streams.read();
            match streams.get(stream) {
                Some(s) => s.entries.len() as u64,
                None => return Ok(StreamStats::default()),
            }
        };
        let pending = self.pending(stream, group).await?;
        let consumers = {
            let streams = self.state.streams.read();
            streams
                .get(stream)
                .and_then(|s| s.groups.get(group))
                .map(|g| g.consumers.len() as u64)
                .unwrap_or(0)
        };

        Ok(StreamStats {
            length,
            pending: pending.total,
            consumers,
            oldest_pending_ms: pending.oldest_idle_ms,
        })
    }

    async fn health_check(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(payload: &str) -> MessageBody {
        MessageBody {
            vehicle_id: Some("V1".into()),
            timestamp: None,
            payload: payload.to_string(),
            data_type: None,
        }
    }

    #[tokio::test]
    async fn test_publish_read_ack_cycle() {
        let backend = MemoryBackend::new();
        backend.create_group("s", "g", GroupStart::Earliest).await.unwrap();

        let id = backend.publish("s", body("m1")).await.unwrap();
        let batch = backend.read_group("s", "g", "c1", 10, 0).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);
        assert_eq!(batch[0].body.payload, "m1");

        let pending = backend.pending("s", "g").await.unwrap();
        assert_eq!(pending.total, 1);
        assert_eq!(pending.per_consumer.get("c1"), Some(&1));

        let acked = backend.ack("s", "g", &[id]).await.unwrap();
        assert_eq!(acked, 1);
        assert_eq!(backend.pending("s", "g").await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_group_delivers_each_message_to_one_consumer() {
        let backend = MemoryBackend::new();
        backend.create_group("s", "g", GroupStart::Earliest).await.unwrap();

        for i in 0..4 {
            backend.publish("s", body(&format!("m{}", i))).await.unwrap();
        }

        let a = backend.read_group("s", "g", "a", 2, 0).await.unwrap();
        let b = backend.read_group("s", "g", "b", 10, 0).await.unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
        let mut ids: Vec<_> = a.iter().chain(b.iter()).map(|e| e.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4, "no message delivered twice within the group");
    }

    #[tokio::test]
    async fn test_two_groups_each_see_every_message() {
        let backend = MemoryBackend::new();
        backend.create_group("s", "g1", GroupStart::Earliest).await.unwrap();
        backend.create_group("s", "g2", GroupStart::Earliest).await.unwrap();

        backend.publish("s", body("m")).await.unwrap();

        assert_eq!(backend.read_group("s", "g1", "c", 10, 0).await.unwrap().len(), 1);
        assert_eq!(backend.read_group("s", "g2", "c", 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_group_start_latest_skips_history() {
        let backend = MemoryBackend::new();
        backend.publish("s", body("old")).await.unwrap();
        backend.create_group("s", "g", GroupStart::Latest).await.unwrap();
        backend.publish("s", body("new")).await.unwrap();

        let batch = backend.read_group("s", "g", "c", 10, 0).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body.payload, "new");
    }

    #[tokio::test]
    async fn test_create_group_is_idempotent() {
        let backend = MemoryBackend::new();
        backend.create_group("s", "g", GroupStart::Earliest).await.unwrap();
        backend.publish("s", body("m")).await.unwrap();
        let _ = backend.read_group("s", "g", "c", 10, 0).await.unwrap();

        // Re-creation must not reset the cursor or pending state
        backend.create_group("s", "g", GroupStart::Earliest).await.unwrap();
        assert!(backend.read_group("s", "g", "c", 10, 0).await.unwrap().is_empty());
        assert_eq!(backend.pending("s", "g").await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_claim_stale_transfers_ownership() {
        let backend = MemoryBackend::new();
        backend.create_group("s", "g", GroupStart::Earliest).await.unwrap();
        backend.publish("s", body("m")).await.unwrap();

        let batch = backend.read_group("s", "g", "dead", 10, 0).await.unwrap();
        assert_eq!(batch.len(), 1);

        let claimed = backend.claim_stale("s", "g", "alive", 0, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].body.payload, "m");

        let pending = backend.pending("s", "g").await.unwrap();
        assert_eq!(pending.per_consumer.get("alive"), Some(&1));
        assert_eq!(pending.per_consumer.get("dead"), None);
    }

    #[tokio::test]
    async fn test_claim_respects_min_idle() {
        let backend = MemoryBackend::new();
        backend.create_group("s", "g", GroupStart::Earliest).await.unwrap();
        let id = backend.publish("s", body("m")).await.unwrap();
        let _ = backend.read_group("s", "g", "c1", 10, 0).await.unwrap();

        // Freshly delivered: an hour of required idle blocks the claim
        let claimed = backend
            .claim("s", "g", "c2", 3_600_000, std::slice::from_ref(&id))
            .await
            .unwrap();
        assert!(claimed.is_empty());

        let claimed = backend.claim("s", "g", "c2", 0, &[id]).await.unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn test_trim_caps_length_and_clears_pending() {
        let backend = MemoryBackend::new();
        backend.create_group("s", "g", GroupStart::Earliest).await.unwrap();
        for i in 0..10 {
            backend.publish("s", body(&format!("m{}", i))).await.unwrap();
        }
        let _ = backend.read_group("s", "g", "c", 10, 0).await.unwrap();

        let removed = backend.trim("s", 3).await.unwrap();
        assert_eq!(removed, 7);

        let stats = backend.stats("s", "g").await.unwrap();
        assert_eq!(stats.length, 3);
        assert_eq!(stats.pending, 3);
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_publish() {
        let backend = Arc::new(MemoryBackend::new());
        backend.create_group("s", "g", GroupStart::Earliest).await.unwrap();

        let reader = Arc::clone(&backend);
        let handle =
            tokio::spawn(async move { reader.read_group("s", "g", "c", 1, 2000).await.unwrap() });

        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.publish("s", body("late")).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body.payload, "late");
    }

    #[tokio::test]
    async fn test_blocking_read_times_out_empty() {
        let backend = MemoryBackend::new();
        backend.create_group("s", "g", GroupStart::Earliest).await.unwrap();
        let start = Instant::now();
        let batch = backend.read_group("s", "g", "c", 1, 50).await.unwrap();
        assert!(batch.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_ids_are_monotone() {
        let backend = MemoryBackend::new();
        let mut prev = (0, 0);
        for _ in 0..50 {
            let id = backend.publish("s", body("m")).await.unwrap();
            let parsed = parse_id(&id).unwrap();
            assert!(parsed > prev);
            prev = parsed;
        }
    }

    #[tokio::test]
    async fn test_count_since_and_last_entry() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.count_since("s", 0).await.unwrap(), 0);
        assert!(backend.last_entry("s").await.unwrap().is_none());

        for _ in 0..3 {
            backend.publish("s", body("m")).await.unwrap();
        }
        assert_eq!(backend.count_since("s", 0).await.unwrap(), 3);
        let last = backend.last_entry("s").await.unwrap().unwrap();
        assert!(last.id_ms() > 0);
        // A cutoff in the future counts nothing
        assert_eq!(
            backend
                .count_since("s", chrono::Utc::now().timestamp_millis() + 60_000)
                .await
                .unwrap(),
            0
        );
    }
}
