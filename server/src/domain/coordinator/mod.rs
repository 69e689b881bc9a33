//! Coordinator
//!
//! Service registry, load balancer, autoscaler, and failure detector. The
//! broker is the only coupling to the workers: heartbeats arrive on the
//! registry stream, scale commands leave on the control stream, and backlog
//! is observed through pending counts. No component references another
//! directly.

mod load;
mod registry;
mod scaling;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub use load::{best_worker, load_score};
pub use registry::WorkerRegistry;
pub use scaling::{FamilyScaler, ScaleDecision, ScalerOptions};

use crate::core::constants::{
    CIRCUIT_FAILURE_THRESHOLD, CIRCUIT_WINDOW_SECS, COORDINATOR_SCAN_INTERVAL_SECS, GROUP_REGISTRY,
    READ_BLOCK_MS, STREAM_CONTROL, STREAM_HEARTBEATS, STREAM_RAW, WORKER_TTL_SECS,
};
use crate::data::broker::{BrokerError, BrokerService, GroupStart};
use crate::data::types::{FaultFamily, ScaleCommand, WorkerRegistration, WorkerState};
use crate::utils::time::now_ms;

/// Coordinator tuning; tests shrink the windows
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub ttl_secs: u64,
    pub scan_interval: Duration,
    pub read_block_ms: u64,
    pub scaler: ScalerOptions,
    pub circuit_threshold: u32,
    pub circuit_window_ms: i64,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            ttl_secs: WORKER_TTL_SECS,
            scan_interval: Duration::from_secs(COORDINATOR_SCAN_INTERVAL_SECS),
            read_block_ms: READ_BLOCK_MS,
            scaler: ScalerOptions::default(),
            circuit_threshold: CIRCUIT_FAILURE_THRESHOLD,
            circuit_window_ms: CIRCUIT_WINDOW_SECS * 1000,
        }
    }
}

// ============================================================================
// SHARED STATE
// ============================================================================

/// Coordinator state shared with the API (single writer, snapshot reads)
pub struct CoordinatorState {
    registry: WorkerRegistry,
    degraded: AtomicBool,
    pub scale_events: AtomicU64,
    pub suppressed_registrations: AtomicU64,
    /// Pending messages observed orphaned by an evicted worker (recovered
    /// by surviving workers' claim scans)
    pub orphaned_pending: AtomicU64,
}

impl CoordinatorState {
    fn new(ttl_secs: u64) -> Self {
        Self {
            registry: WorkerRegistry::new(ttl_secs),
            degraded: AtomicBool::new(false),
            scale_events: AtomicU64::new(0),
            suppressed_registrations: AtomicU64::new(0),
            orphaned_pending: AtomicU64::new(0),
        }
    }

    /// Live workers; falls back to the last-known-good snapshot while the
    /// registry is degraded (broker read storms)
    pub fn workers(&self) -> Vec<WorkerRegistration> {
        if self.is_degraded() {
            self.registry.last_good_snapshot()
        } else {
            self.registry.snapshot()
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn worker_count(&self) -> usize {
        self.registry.len()
    }

    pub fn evictions(&self) -> u64 {
        self.registry.evictions.load(Ordering::Relaxed)
    }

    /// Advisory: best-scoring worker for the family right now
    pub fn advise_worker(&self, family: FaultFamily) -> Option<WorkerRegistration> {
        let workers = self.workers();
        best_worker(workers.iter(), family).cloned()
    }
}

/// Consecutive-failure tracking for worker ids
#[derive(Debug, Default)]
struct FailureTracker {
    failures: HashMap<String, (u32, i64)>,
}

impl FailureTracker {
    fn record(&mut self, worker_id: &str, now_ms: i64, window_ms: i64) {
        let entry = self.failures.entry(worker_id.to_string()).or_insert((0, now_ms));
        if now_ms - entry.1 > window_ms {
            *entry = (1, now_ms);
        } else {
            entry.0 += 1;
            entry.1 = now_ms;
        }
    }

    fn is_open(&mut self, worker_id: &str, now_ms: i64, threshold: u32, window_ms: i64) -> bool {
        match self.failures.get(worker_id) {
            Some(&(count, last)) if now_ms - last <= window_ms => count >= threshold,
            Some(_) => {
                self.failures.remove(worker_id);
                false
            }
            None => false,
        }
    }
}

// ============================================================================
// COORDINATOR TASK
// ============================================================================

pub struct Coordinator {
    broker: BrokerService,
    options: CoordinatorOptions,
    state: Arc<CoordinatorState>,
    scalers: HashMap<FaultFamily, FamilyScaler>,
    failures: FailureTracker,
}

impl Coordinator {
    pub fn new(broker: BrokerService, options: CoordinatorOptions) -> Self {
        let scalers = FaultFamily::ALL
            .into_iter()
            .map(|family| (family, FamilyScaler::new(family, options.scaler.clone())))
            .collect();
        let state = Arc::new(CoordinatorState::new(options.ttl_secs));
        Self {
            broker,
            options,
            state,
            scalers,
            failures: FailureTracker::default(),
        }
    }

    pub fn state(&self) -> Arc<CoordinatorState> {
        Arc::clone(&self.state)
    }

    /// Spawn the coordinator loop; resolves ready once subscribed
    pub async fn start(
        mut self,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, BrokerError> {
        let consumer = format!("coordinator:{}", Uuid::new_v4());
        let heartbeats = self
            .broker
            .stream::<WorkerRegistration>(STREAM_HEARTBEATS)
            .reader(GROUP_REGISTRY, &consumer, GroupStart::Latest)
            .await?;

        tracing::debug!(consumer = %consumer, "Coordinator started");

        Ok(tokio::spawn(async move {
            let mut scan_interval = tokio::time::interval(self.options.scan_interval);
            scan_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }

                    _ = scan_interval.tick() => {
                        self.scan().await;
                    }

                    batch = heartbeats.read(64, self.options.read_block_ms) => {
                        match batch {
                            Ok(batch) => {
                                self.state.degraded.store(false, Ordering::Relaxed);
                                let mut ids = Vec::with_capacity(batch.len());
                                for delivery in batch {
                                    if let Ok(registration) = delivery.payload {
                                        self.apply_heartbeat(registration);
                                    } else {
                                        tracing::warn!(msg_id = %delivery.id, "Discarding malformed heartbeat");
                                    }
                                    ids.push(delivery.id);
                                }
                                if let Err(e) = heartbeats.ack(&ids).await {
                                    tracing::warn!(error = %e, "Failed to ack heartbeats");
                                }
                            }
                            Err(e) => {
                                // Registry storm or broker blip: serve the
                                // last-known-good snapshot until reads recover
                                tracing::warn!(error = %e, "Heartbeat read failed, registry degraded");
                                self.state.degraded.store(true, Ordering::Relaxed);
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
            }

            tracing::debug!("Coordinator stopped");
        }))
    }

    /// Fold a heartbeat into the registry, honoring the circuit breaker:
    /// a worker id seen failing repeatedly is suppressed from re-registering
    /// until the window expires.
    fn apply_heartbeat(&mut self, registration: WorkerRegistration) {
        let now = now_ms();
        if registration.state != WorkerState::Stopped
            && self.failures.is_open(
                &registration.worker_id,
                now,
                self.options.circuit_threshold,
                self.options.circuit_window_ms,
            )
        {
            tracing::warn!(
                worker = %registration.worker_id,
                "Suppressing registration of circuit-broken worker"
            );
            self.state
                .suppressed_registrations
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.state.registry.apply(registration);
    }

    /// Periodic sweep: evict stale workers, account for their orphaned
    /// pending messages, and drive the per-family autoscalers.
    async fn scan(&mut self) {
        let now = chrono::Utc::now();
        let now_millis = now_ms();

        let evicted = self.state.registry.evict_stale(now);
        for worker in &evicted {
            self.failures
                .record(&worker.worker_id, now_millis, self.options.circuit_window_ms);
            for family in &worker.families {
                match self.broker.pending(STREAM_RAW, &family.group_name()).await {
                    Ok(summary) => {
                        let orphaned = summary
                            .per_consumer
                            .get(&worker.worker_id)
                            .copied()
                            .unwrap_or(0);
                        if orphaned > 0 {
                            // Surviving workers claim these once idle past
                            // the TTL; the coordinator only accounts for them
                            self.state
                                .orphaned_pending
                                .fetch_add(orphaned, Ordering::Relaxed);
                            tracing::warn!(
                                worker = %worker.worker_id,
                                family = %family,
                                orphaned,
                                "Evicted worker left pending messages for claim recovery"
                            );
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Pending inspection failed during eviction");
                    }
                }
            }
            tracing::warn!(worker = %worker.worker_id, "Worker evicted (heartbeat TTL elapsed)");
        }

        let workers = self.state.registry.snapshot();
        let mut scan_ok = true;
        for family in FaultFamily::ALL {
            let stats = match self.broker.stats(STREAM_RAW, &family.group_name()).await {
                Ok(stats) => stats,
                Err(e) => {
                    tracing::warn!(family = %family, error = %e, "Stats read failed");
                    scan_ok = false;
                    continue;
                }
            };

            let members: Vec<&WorkerRegistration> = workers
                .iter()
                .filter(|w| w.families.contains(&family) && w.state.is_consuming())
                .collect();
            let pool_size = members.len();
            let avg_utilization = if members.is_empty() {
                0.0
            } else {
                members.iter().map(|w| w.load.cpu_pct / 100.0).sum::<f64>() / members.len() as f64
            };

            let Some(scaler) = self.scalers.get_mut(&family) else {
                continue;
            };
            if let Some(decision) =
                scaler.observe(now_millis, stats.pending, pool_size, avg_utilization)
            {
                let target = match decision {
                    ScaleDecision::Up => pool_size + 1,
                    ScaleDecision::Down => pool_size.saturating_sub(1),
                };
                tracing::info!(
                    family = %family,
                    backlog = stats.pending,
                    pool_size,
                    target,
                    "Autoscaler decision"
                );
                let command = ScaleCommand {
                    family,
                    target_consumers: target,
                    issued_by: "autoscaler".into(),
                    issued_at: now,
                };
                match self
                    .broker
                    .stream::<ScaleCommand>(STREAM_CONTROL)
                    .publish(None, Some("scale"), &command)
                    .await
                {
                    Ok(_) => {
                        self.state.scale_events.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to publish scale command");
                    }
                }
            }
        }

        if scan_ok {
            self.state.registry.commit_good_snapshot();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::{VehicleSample, WorkerLoad};
    use chrono::{TimeZone, Utc};

    fn options() -> CoordinatorOptions {
        CoordinatorOptions {
            ttl_secs: 15,
            scan_interval: Duration::from_millis(50),
            read_block_ms: 20,
            scaler: ScalerOptions {
                up_threshold: 5,
                down_threshold: 2,
                sustain_up_ms: 0,
                sustain_down_ms: 0,
                cooldown_ms: 0,
                idle_utilization: 0.2,
                min_consumers: 1,
                max_consumers: 8,
            },
            circuit_threshold: 3,
            circuit_window_ms: 60_000,
        }
    }

    fn registration(worker_id: &str, heartbeat: chrono::DateTime<Utc>) -> WorkerRegistration {
        WorkerRegistration {
            worker_id: worker_id.into(),
            families: vec![FaultFamily::Bearing],
            bind_address: "127.0.0.1:0".into(),
            started_at: heartbeat,
            last_heartbeat: heartbeat,
            state: WorkerState::Running,
            load: WorkerLoad {
                cpu_pct: 50.0,
                success_rate: 1.0,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_failure_tracker_circuit() {
        let mut tracker = FailureTracker::default();
        tracker.record("w1", 1_000, 60_000);
        tracker.record("w1", 2_000, 60_000);
        assert!(!tracker.is_open("w1", 2_500, 3, 60_000));
        tracker.record("w1", 3_000, 60_000);
        assert!(tracker.is_open("w1", 3_500, 3, 60_000));
        // Window expiry closes the circuit
        assert!(!tracker.is_open("w1", 70_000, 3, 60_000));
    }

    #[tokio::test]
    async fn test_heartbeats_populate_registry_and_ttl_evicts() {
        let broker = BrokerService::memory();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let coordinator = Coordinator::new(broker.clone(), options());
        let state = coordinator.state();
        let handle = coordinator.start(shutdown_rx).await.unwrap();

        let heartbeats = broker.stream::<WorkerRegistration>(STREAM_HEARTBEATS);
        heartbeats
            .publish(None, Some("registration"), &registration("bearing_consumer_0", Utc::now()))
            .await
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while state.worker_count() == 0 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.worker_count(), 1);

        // A heartbeat far in the past is evicted on the next sweep
        heartbeats
            .publish(
                None,
                Some("registration"),
                &registration("bearing_consumer_1", Utc.timestamp_opt(1_700_000_000, 0).unwrap()),
            )
            .await
            .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while state.evictions() == 0 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.evictions(), 1);
        assert_eq!(state.worker_count(), 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_backlog_triggers_scale_command() {
        let broker = BrokerService::memory();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let coordinator = Coordinator::new(broker.clone(), options());
        let state = coordinator.state();

        // One registered bearing worker, so pool_size = 1 < max
        let handle = coordinator.start(shutdown_rx).await.unwrap();
        broker
            .stream::<WorkerRegistration>(STREAM_HEARTBEATS)
            .publish(None, Some("registration"), &registration("bearing_consumer_0", Utc::now()))
            .await
            .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while state.worker_count() == 0 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.worker_count(), 1);

        // Build a pending backlog: deliver without acking
        let raw = broker.stream::<VehicleSample>(STREAM_RAW);
        let stale_reader = raw
            .reader(
                &FaultFamily::Bearing.group_name(),
                "bearing_consumer_0",
                GroupStart::Earliest,
            )
            .await
            .unwrap();
        for i in 0..10 {
            let sample = VehicleSample {
                vehicle_id: "V1".into(),
                timestamp: Utc.timestamp_opt(1_700_000_000 + i, 0).unwrap(),
                currents: [10.0, 10.0, 10.0],
                voltage: 380.0,
                speed: 1450.0,
                torque: 50.0,
                temperature: 60.0,
                location: None,
                metadata: None,
            };
            raw.publish(Some("V1"), Some("sensor"), &sample).await.unwrap();
        }
        let delivered = stale_reader.read(10, 500).await.unwrap();
        assert_eq!(delivered.len(), 10);

        // The control stream receives an Up command for bearing
        let control = broker
            .stream::<ScaleCommand>(STREAM_CONTROL)
            .reader("test_control", "r", GroupStart::Earliest)
            .await
            .unwrap();
        let mut command = None;
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while command.is_none() && std::time::Instant::now() < deadline {
            command = control.read(1, 100).await.unwrap().into_iter().next();
        }
        let command = command.unwrap().payload.unwrap();
        assert_eq!(command.family, FaultFamily::Bearing);
        assert_eq!(command.target_consumers, 2);
        assert!(state.scale_events.load(Ordering::Relaxed) >= 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
