//! Stream backend trait definition
//!
//! The broker is an ordered, append-only log with consumer-group fan-out and
//! per-message acknowledgment. Two implementations exist: in-memory (single
//! process, reduced durability) and Redis Streams (distributed).
//!
//! Delivery semantics: at-least-once within a group. A message delivered via
//! `read_group` sits on the group's pending list under its consumer until
//! acked or claimed by another consumer. Ordering is FIFO by id within a
//! single consumer.

use std::collections::HashMap;

use async_trait::async_trait;

use super::error::BrokerError;

/// Where a newly created consumer group starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    /// Only messages published after group creation
    Latest,
    /// Everything still retained in the stream
    Earliest,
}

/// Field set carried by every stream message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageBody {
    /// Keying field; empty for control/sentinel messages
    pub vehicle_id: Option<String>,
    /// Publisher wall-clock timestamp, RFC 3339
    pub timestamp: Option<String>,
    /// JSON-encoded payload
    pub payload: String,
    /// Payload type discriminator
    pub data_type: Option<String>,
}

/// One entry read from a stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    /// Monotone id within the stream, `<ms>-<seq>` form
    pub id: String,
    pub body: MessageBody,
}

impl StreamEntry {
    /// Milliseconds component of the entry id
    pub fn id_ms(&self) -> i64 {
        id_to_ms(&self.id)
    }
}

/// Parse the millisecond prefix out of a `<ms>-<seq>` stream id
pub fn id_to_ms(id: &str) -> i64 {
    id.split('-')
        .next()
        .and_then(|ms| ms.parse().ok())
        .unwrap_or(0)
}

/// Per-group pending summary
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingSummary {
    pub total: u64,
    pub per_consumer: HashMap<String, u64>,
    /// Idle time of the oldest pending message
    pub oldest_idle_ms: Option<u64>,
}

/// Stream statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamStats {
    /// Total messages retained in the stream
    pub length: u64,
    /// Messages pending acknowledgment in the group
    pub pending: u64,
    /// Consumers seen in the group
    pub consumers: u64,
    /// Idle time of the oldest pending message
    pub oldest_pending_ms: Option<u64>,
}

/// Stream broker backend trait
#[async_trait]
pub trait StreamBackend: Send + Sync {
    /// Append a message; returns its id (monotone within the stream).
    ///
    /// Fails with [`BrokerError::Unavailable`] when the broker is
    /// unreachable or [`BrokerError::StreamFull`] when the stream refuses
    /// the append.
    async fn publish(&self, stream: &str, body: MessageBody) -> Result<String, BrokerError>;

    /// Create a consumer group. Idempotent; re-creation is a no-op.
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<(), BrokerError>;

    /// Read up to `count` new messages for `consumer`, blocking up to
    /// `block_ms` when the stream has nothing to deliver. Returned ids are
    /// added to the group's pending list under `consumer`.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    /// Acknowledge processed messages, removing them from pending.
    /// Returns the number of entries actually removed.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, BrokerError>;

    /// Inspect the group's pending list
    async fn pending(&self, stream: &str, group: &str) -> Result<PendingSummary, BrokerError>;

    /// Reassign specific pending messages to `new_consumer` if they have
    /// been idle at least `min_idle_ms`. Returns the entries transferred.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    /// Discover and reassign up to `count` stale pending messages (idle at
    /// least `min_idle_ms`) to `new_consumer`. Recovery path for crashed
    /// consumers.
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    /// Trim the stream to approximately `max_len` entries.
    /// Returns the number of entries removed.
    async fn trim(&self, stream: &str, max_len: u64) -> Result<u64, BrokerError>;

    /// Read up to `count` retained entries with id-time >= `start_ms`
    /// (oldest first). `start_ms = 0` scans from the beginning of retention.
    async fn range(
        &self,
        stream: &str,
        start_ms: i64,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    /// Most recent entry in the stream, if any
    async fn last_entry(&self, stream: &str) -> Result<Option<StreamEntry>, BrokerError>;

    /// Count entries with id-time >= `since_ms`
    async fn count_since(&self, stream: &str, since_ms: i64) -> Result<u64, BrokerError>;

    /// Stream + group statistics for monitoring
    async fn stats(&self, stream: &str, group: &str) -> Result<StreamStats, BrokerError>;

    /// Health check (validates connection)
    async fn health_check(&self) -> Result<(), BrokerError>;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}
