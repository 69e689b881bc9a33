//! Frontend bridge
//!
//! Tails the results and health streams with its own consumer groups and
//! pushes self-describing messages to connected subscribers. Subscriber
//! slowness never stalls the broker read loop: queues coalesce and drop
//! (counted), hard-limit offenders are disconnected, and acks happen after
//! the push attempt regardless of subscriber fate.

mod cache;
mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub use cache::{CacheStats, ReplayCache, StreamKind};
pub use session::{EnqueueOutcome, Session};

use crate::core::constants::{
    BRIDGE_DEDUP_WINDOW_MS, GROUP_BRIDGE_FAULT, GROUP_BRIDGE_HEALTH, READ_BLOCK_MS, STREAM_HEALTH,
    STREAM_RESULTS,
};
use crate::data::broker::{BrokerError, BrokerService, GroupStart};
use crate::data::types::{FaultScore, FaultStatus, HealthAssessment, PushMessage};
use crate::utils::time::now_ms;

/// Bridge tuning; tests shrink the windows
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub read_block_ms: u64,
    pub dedup_window_ms: i64,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            read_block_ms: READ_BLOCK_MS,
            dedup_window_ms: BRIDGE_DEDUP_WINDOW_MS,
        }
    }
}

// ============================================================================
// SHARED STATE
// ============================================================================

/// Bridge state shared with the WebSocket handlers
pub struct BridgeState {
    options: BridgeOptions,
    sessions: DashMap<Uuid, Arc<Session>>,
    cache: Mutex<ReplayCache>,
    /// (vehicle, stream) -> (last status, last push ms) for dedup
    dedup: Mutex<HashMap<(String, StreamKind), (FaultStatus, i64)>>,
    pub pushed: AtomicU64,
    pub deduped: AtomicU64,
    pub disconnected: AtomicU64,
}

impl BridgeState {
    fn new(options: BridgeOptions) -> Self {
        Self {
            options,
            sessions: DashMap::new(),
            cache: Mutex::new(ReplayCache::new()),
            dedup: Mutex::new(HashMap::new()),
            pushed: AtomicU64::new(0),
            deduped: AtomicU64::new(0),
            disconnected: AtomicU64::new(0),
        }
    }

    /// Attach a new subscriber, warming its queue from the replay cache
    pub fn attach(&self) -> Arc<Session> {
        let session = Arc::new(Session::new());
        for message in self.cache.lock().replay_all() {
            session.enqueue(message);
        }
        self.sessions.insert(session.id(), Arc::clone(&session));
        tracing::debug!(session = %session.id(), "Subscriber attached");
        session
    }

    /// Drop a subscriber; its queue goes with it
    pub fn detach(&self, id: Uuid) {
        if let Some((_, session)) = self.sessions.remove(&id) {
            session.disconnect();
            tracing::debug!(session = %id, "Subscriber detached");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Total messages dropped across live sessions
    pub fn total_dropped(&self) -> u64 {
        self.sessions.iter().map(|s| s.dropped()).sum()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }

    /// Subscriber push latency feedback, drives cache sizing
    pub fn observe_push_latency(&self, latency_ms: u64) {
        self.cache.lock().observe_push_latency(latency_ms);
    }

    /// Fan a message out to every session. Consecutive identical-status
    /// messages per vehicle within the dedup window are suppressed.
    fn fan_out(&self, kind: StreamKind, message: PushMessage) {
        let now = now_ms();
        {
            let mut dedup = self.dedup.lock();
            let key = (message.vehicle_id().to_string(), kind);
            if let Some((status, last_ms)) = dedup.get(&key)
                && *status == message.status()
                && now - last_ms < self.options.dedup_window_ms
            {
                self.deduped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            dedup.insert(key, (message.status(), now));
        }

        self.cache.lock().record(kind, &message);

        let mut dead = Vec::new();
        for entry in self.sessions.iter() {
            if entry.value().enqueue(message.clone()) == EnqueueOutcome::Disconnected {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            tracing::warn!(session = %id, "Subscriber exceeded hard limit, disconnecting");
            self.disconnected.fetch_add(1, Ordering::Relaxed);
            self.detach(id);
        }
        self.pushed.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// BRIDGE TASKS
// ============================================================================

pub struct FrontendBridge {
    broker: BrokerService,
    state: Arc<BridgeState>,
}

impl FrontendBridge {
    pub fn new(broker: BrokerService, options: BridgeOptions) -> Self {
        Self {
            broker,
            state: Arc::new(BridgeState::new(options)),
        }
    }

    pub fn state(&self) -> Arc<BridgeState> {
        Arc::clone(&self.state)
    }

    /// Spawn the two tail loops; resolves ready once both are subscribed
    pub async fn start(
        &self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, BrokerError> {
        let fault_tail = self
            .spawn_tail::<FaultScore>(
                STREAM_RESULTS,
                GROUP_BRIDGE_FAULT,
                StreamKind::Fault,
                PushMessage::FaultScore,
                shutdown_rx.clone(),
            )
            .await?;
        let health_tail = self
            .spawn_tail::<HealthAssessment>(
                STREAM_HEALTH,
                GROUP_BRIDGE_HEALTH,
                StreamKind::Health,
                PushMessage::HealthAssessment,
                shutdown_rx,
            )
            .await?;
        Ok(vec![fault_tail, health_tail])
    }

    async fn spawn_tail<T>(
        &self,
        stream: &str,
        group: &str,
        kind: StreamKind,
        wrap: fn(T) -> PushMessage,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, BrokerError>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
    {
        let consumer = format!("bridge:{}", Uuid::new_v4());
        let reader = self
            .broker
            .stream::<T>(stream)
            .reader(group, &consumer, GroupStart::Latest)
            .await?;
        let state = Arc::clone(&self.state);
        let read_block_ms = self.state.options.read_block_ms;

        tracing::debug!(stream, group, consumer = %consumer, "Bridge tail started");

        let stream = stream.to_string();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }

                    batch = reader.read(32, read_block_ms) => {
                        let batch = match batch {
                            Ok(batch) => batch,
                            Err(e) => {
                                tracing::warn!(stream, error = %e, "Bridge read failed, backing off");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                                continue;
                            }
                        };
                        let mut ids = Vec::with_capacity(batch.len());
                        for delivery in batch {
                            match delivery.payload {
                                Ok(value) => state.fan_out(kind, wrap(value)),
                                Err(e) => {
                                    tracing::warn!(stream, msg_id = %delivery.id, error = %e, "Discarding malformed message");
                                }
                            }
                            // Ack after push attempt; subscriber fate never
                            // blocks the stream
                            ids.push(delivery.id);
                        }
                        if let Err(e) = reader.ack(&ids).await {
                            tracing::warn!(stream, error = %e, "Failed to ack pushed messages");
                        }
                    }
                }
            }
            tracing::debug!(stream, "Bridge tail stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::{AlertLevel, FaultFamily};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn options() -> BridgeOptions {
        BridgeOptions {
            read_block_ms: 20,
            dedup_window_ms: 2_000,
        }
    }

    fn score(vehicle: &str, severity: f64, status: FaultStatus) -> FaultScore {
        FaultScore {
            vehicle_id: vehicle.into(),
            sample_timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            family: FaultFamily::Bearing,
            severity,
            status,
            features: BTreeMap::new(),
            produced_by: "test".into(),
            processing_latency_ms: 1,
        }
    }

    #[test]
    fn test_fan_out_dedups_consecutive_identical_status() {
        let state = BridgeState::new(options());
        let session = state.attach();

        state.fan_out(StreamKind::Fault, PushMessage::FaultScore(score("V1", 0.1, FaultStatus::Normal)));
        state.fan_out(StreamKind::Fault, PushMessage::FaultScore(score("V1", 0.12, FaultStatus::Normal)));
        // Status transition always goes through
        state.fan_out(StreamKind::Fault, PushMessage::FaultScore(score("V1", 0.7, FaultStatus::Fault)));

        assert_eq!(session.queue_len(), 2);
        assert_eq!(state.deduped.load(Ordering::Relaxed), 1);
        assert_eq!(state.pushed.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_dedup_is_per_vehicle() {
        let state = BridgeState::new(options());
        let session = state.attach();

        state.fan_out(StreamKind::Fault, PushMessage::FaultScore(score("V1", 0.1, FaultStatus::Normal)));
        state.fan_out(StreamKind::Fault, PushMessage::FaultScore(score("V2", 0.1, FaultStatus::Normal)));
        assert_eq!(session.queue_len(), 2);
        assert_eq!(state.deduped.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_new_subscriber_replays_cache() {
        let state = BridgeState::new(options());
        state.fan_out(StreamKind::Fault, PushMessage::FaultScore(score("V1", 0.1, FaultStatus::Normal)));
        state.fan_out(StreamKind::Health, PushMessage::HealthAssessment(HealthAssessment {
            vehicle_id: "V1".into(),
            assessed_at: Utc.timestamp_opt(1_700_000_001, 0).unwrap(),
            per_family_scores: BTreeMap::new(),
            composite_score: 0.1,
            overall_status: FaultStatus::Normal,
            alert_level: AlertLevel::None,
        }));

        let late = state.attach();
        assert_eq!(late.queue_len(), 2);
    }

    #[test]
    fn test_detach_drops_session() {
        let state = BridgeState::new(options());
        let session = state.attach();
        assert_eq!(state.session_count(), 1);
        state.detach(session.id());
        assert_eq!(state.session_count(), 0);
        assert!(session.is_disconnected());
    }

    #[tokio::test]
    async fn test_bridge_tails_results_to_subscribers() {
        let broker = BrokerService::memory();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let bridge = FrontendBridge::new(broker.clone(), options());
        let state = bridge.state();
        let handles = bridge.start(shutdown_rx).await.unwrap();

        let session = state.attach();
        broker
            .stream::<FaultScore>(STREAM_RESULTS)
            .publish(Some("V1"), Some("fault_score"), &score("V1", 0.4, FaultStatus::Warning))
            .await
            .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(3), session.recv())
            .await
            .unwrap()
            .unwrap();
        match message {
            PushMessage::FaultScore(s) => {
                assert_eq!(s.vehicle_id, "V1");
                assert_eq!(s.status, FaultStatus::Warning);
            }
            other => panic!("unexpected push message: {:?}", other),
        }

        // Results stream pending stays bounded (acked after push)
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let pending = broker.pending(STREAM_RESULTS, GROUP_BRIDGE_FAULT).await.unwrap();
            if pending.total == 0 || std::time::Instant::now() > deadline {
                assert_eq!(pending.total, 0);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
