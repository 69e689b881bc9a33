//! Stream broker adapter
//!
//! Thin capability wrapper over the append-only message broker. Two backends
//! implement the [`StreamBackend`] contract:
//! - `memory` — single-process, reduced durability (development, tests)
//! - `redis` — Redis Streams (production)
//!
//! [`BrokerService`] is the shared handle components hold; [`JsonStream`]
//! layers the cluster's wire convention on top (fields `vehicle_id`,
//! `timestamp`, JSON `payload`, optional `data_type`).

mod backend;
mod error;
mod memory;
mod redis;

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

pub use backend::{
    GroupStart, MessageBody, PendingSummary, StreamBackend, StreamEntry, StreamStats, id_to_ms,
};
pub use error::BrokerError;
pub use memory::MemoryBackend;
pub use redis::RedisBackend;

use crate::utils::time::now_rfc3339;

// ============================================================================
// BROKER SERVICE
// ============================================================================

/// Shared broker handle
#[derive(Clone)]
pub struct BrokerService {
    backend: Arc<dyn StreamBackend>,
}

impl BrokerService {
    /// In-memory backend (reduced-durability profile)
    pub fn memory() -> Self {
        Self {
            backend: Arc::new(MemoryBackend::new()),
        }
    }

    /// Redis Streams backend; validates the connection before returning
    pub async fn connect_redis(url: &str) -> Result<Self, BrokerError> {
        Ok(Self {
            backend: Arc::new(RedisBackend::connect(url).await?),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    pub async fn health_check(&self) -> Result<(), BrokerError> {
        self.backend.health_check().await
    }

    /// Typed handle for a named stream
    pub fn stream<T>(&self, name: &str) -> JsonStream<T>
    where
        T: Serialize + DeserializeOwned,
    {
        JsonStream {
            name: name.to_string(),
            backend: Arc::clone(&self.backend),
            _phantom: PhantomData,
        }
    }

    pub async fn stats(&self, stream: &str, group: &str) -> Result<StreamStats, BrokerError> {
        self.backend.stats(stream, group).await
    }

    pub async fn pending(&self, stream: &str, group: &str) -> Result<PendingSummary, BrokerError> {
        self.backend.pending(stream, group).await
    }

    pub async fn trim(&self, stream: &str, max_len: u64) -> Result<u64, BrokerError> {
        self.backend.trim(stream, max_len).await
    }

    /// Millisecond timestamp of the most recent entry, if any
    pub async fn last_entry_ms(&self, stream: &str) -> Result<Option<i64>, BrokerError> {
        Ok(self.backend.last_entry(stream).await?.map(|e| e.id_ms()))
    }

    /// Count of entries appended at or after `since_ms`
    pub async fn count_since(&self, stream: &str, since_ms: i64) -> Result<u64, BrokerError> {
        self.backend.count_since(stream, since_ms).await
    }
}

// ============================================================================
// TYPED STREAM HANDLE
// ============================================================================

/// One decoded message delivered from a stream.
///
/// `payload` is a `Result` so consumers can classify malformed messages as
/// poison (ack + count) instead of tripping a redelivery loop.
#[derive(Debug)]
pub struct Delivery<T> {
    pub id: String,
    pub id_ms: i64,
    pub vehicle_id: Option<String>,
    pub payload: Result<T, BrokerError>,
}

/// Typed stream handle using the JSON wire convention
pub struct JsonStream<T>
where
    T: Serialize + DeserializeOwned,
{
    name: String,
    backend: Arc<dyn StreamBackend>,
    _phantom: PhantomData<T>,
}

impl<T> Clone for JsonStream<T>
where
    T: Serialize + DeserializeOwned,
{
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            backend: Arc::clone(&self.backend),
            _phantom: PhantomData,
        }
    }
}

impl<T> JsonStream<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish a value; returns the assigned message id
    pub async fn publish(
        &self,
        vehicle_id: Option<&str>,
        data_type: Option<&str>,
        value: &T,
    ) -> Result<String, BrokerError> {
        let body = MessageBody {
            vehicle_id: vehicle_id.map(str::to_string),
            timestamp: Some(now_rfc3339()),
            payload: serde_json::to_string(value)?,
            data_type: data_type.map(str::to_string),
        };
        self.backend.publish(&self.name, body).await
    }

    /// Create a consumer group (idempotent)
    pub async fn create_group(&self, group: &str, start: GroupStart) -> Result<(), BrokerError> {
        self.backend.create_group(&self.name, group, start).await
    }

    /// Consumer-group reader handle. The group is created (idempotently)
    /// before the first read.
    pub async fn reader(
        &self,
        group: &str,
        consumer: &str,
        start: GroupStart,
    ) -> Result<GroupReader<T>, BrokerError> {
        self.create_group(group, start).await?;
        Ok(GroupReader {
            stream: self.name.clone(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            backend: Arc::clone(&self.backend),
            _phantom: PhantomData,
        })
    }

    /// Bounded history scan: retained entries with id-time >= `since_ms`
    pub async fn read_range(
        &self,
        since_ms: i64,
        count: usize,
    ) -> Result<Vec<Delivery<T>>, BrokerError> {
        let entries = self.backend.range(&self.name, since_ms, count).await?;
        Ok(entries.iter().map(decode_entry).collect())
    }
}

// ============================================================================
// GROUP READER
// ============================================================================

/// Consumer-group reader: read / ack / claim for one (group, consumer) pair
pub struct GroupReader<T>
where
    T: Serialize + DeserializeOwned,
{
    stream: String,
    group: String,
    consumer: String,
    backend: Arc<dyn StreamBackend>,
    _phantom: PhantomData<T>,
}

impl<T> GroupReader<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn consumer_id(&self) -> &str {
        &self.consumer
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Read up to `count` messages, blocking up to `block_ms`
    pub async fn read(&self, count: usize, block_ms: u64) -> Result<Vec<Delivery<T>>, BrokerError> {
        let entries = self
            .backend
            .read_group(&self.stream, &self.group, &self.consumer, count, block_ms)
            .await?;
        Ok(entries.iter().map(decode_entry).collect())
    }

    /// Acknowledge processed messages
    pub async fn ack(&self, ids: &[String]) -> Result<u64, BrokerError> {
        self.backend.ack(&self.stream, &self.group, ids).await
    }

    pub async fn ack_one(&self, id: &str) -> Result<u64, BrokerError> {
        self.ack(&[id.to_string()]).await
    }

    /// Claim stale pending messages from (possibly crashed) peers
    pub async fn claim_stale(
        &self,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<Delivery<T>>, BrokerError> {
        let entries = self
            .backend
            .claim_stale(&self.stream, &self.group, &self.consumer, min_idle_ms, count)
            .await?;
        Ok(entries.iter().map(decode_entry).collect())
    }

    /// Reassign specific pending messages to this consumer
    pub async fn claim(
        &self,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<Delivery<T>>, BrokerError> {
        let entries = self
            .backend
            .claim(&self.stream, &self.group, &self.consumer, min_idle_ms, ids)
            .await?;
        Ok(entries.iter().map(decode_entry).collect())
    }

    /// Pending summary for this reader's group
    pub async fn pending(&self) -> Result<PendingSummary, BrokerError> {
        self.backend.pending(&self.stream, &self.group).await
    }
}

fn decode_entry<T: DeserializeOwned>(entry: &StreamEntry) -> Delivery<T> {
    Delivery {
        id: entry.id.clone(),
        id_ms: entry.id_ms(),
        vehicle_id: entry.body.vehicle_id.clone(),
        payload: serde_json::from_str(&entry.body.payload).map_err(BrokerError::from),
    }
}
