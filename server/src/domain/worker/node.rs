//! Worker node
//!
//! Hosts one fault analyzer, consumes its family's group on the raw stream,
//! publishes scores to the results stream, and heartbeats its load to the
//! registry stream.
//!
//! Uses consumer groups for at-least-once delivery:
//! - Messages are acknowledged after the score is published
//! - Poison samples (deterministic analyzer failure, malformed payload) are
//!   acknowledged anyway and counted in the dead-letter counter, so they
//!   cannot loop
//! - Transient failures leave the message unacked; a claim scan on this or
//!   another worker picks it up after the idle threshold

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::constants::{
    CLAIM_INTERVAL_SECS, CLAIM_MAX_COUNT, CLAIM_MIN_IDLE_MS, DEGRADED_LATENCY_MS,
    DEGRADED_SUCCESS_RATE, HEARTBEAT_INTERVAL_SECS, READ_BATCH, READ_BLOCK_MS, ROLLING_WINDOW_CAP,
    STREAM_HEARTBEATS, STREAM_RAW, STREAM_RESULTS,
};
use crate::data::broker::{BrokerService, Delivery, GroupReader, GroupStart, JsonStream};
use crate::data::types::{
    FaultFamily, FaultScore, VehicleSample, WorkerLoad, WorkerRegistration, WorkerState,
};
use crate::domain::analyzers::{self, FaultAnalyzer, RollingWindow, Thresholds};
use crate::utils::retry::retry_with_backoff;
use crate::utils::time::now_ms;

/// Tuning knobs for a worker node. Defaults come from the cluster constants;
/// tests shrink the intervals.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub read_block_ms: u64,
    pub read_batch: usize,
    pub claim_interval: Duration,
    pub claim_min_idle_ms: u64,
    pub heartbeat_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            read_block_ms: READ_BLOCK_MS,
            read_batch: READ_BATCH,
            claim_interval: Duration::from_secs(CLAIM_INTERVAL_SECS),
            claim_min_idle_ms: CLAIM_MIN_IDLE_MS,
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
        }
    }
}

/// Shared per-worker counters, visible to the pool and the status API
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    pub processed: AtomicU64,
    pub succeeded: AtomicU64,
    /// Poison samples acked into the dead-letter counter
    pub dead_lettered: AtomicU64,
    pub transient_failures: AtomicU64,
    rolling: Mutex<RollingLoad>,
}

#[derive(Debug)]
struct RollingLoad {
    /// Exponentially weighted averages over recent samples
    avg_latency_ms: f64,
    success_rate: f64,
    busy: Duration,
    since: Instant,
}

impl Default for RollingLoad {
    fn default() -> Self {
        Self {
            avg_latency_ms: 0.0,
            success_rate: 1.0,
            busy: Duration::ZERO,
            since: Instant::now(),
        }
    }
}

const EWMA_ALPHA: f64 = 0.1;

impl WorkerMetrics {
    fn record(&self, latency: Duration, success: bool) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        }
        let mut rolling = self.rolling.lock();
        let latency_ms = latency.as_secs_f64() * 1000.0;
        rolling.avg_latency_ms = (1.0 - EWMA_ALPHA) * rolling.avg_latency_ms + EWMA_ALPHA * latency_ms;
        rolling.success_rate =
            (1.0 - EWMA_ALPHA) * rolling.success_rate + EWMA_ALPHA * if success { 1.0 } else { 0.0 };
        rolling.busy += latency;
    }

    /// Load sample for the next heartbeat; resets the busy-ratio window
    fn load_sample(&self, pending_backlog: u64, queue_length: u64) -> WorkerLoad {
        let mut rolling = self.rolling.lock();
        let elapsed = rolling.since.elapsed().as_secs_f64().max(1e-3);
        let cpu_pct = (rolling.busy.as_secs_f64() / elapsed).clamp(0.0, 1.0) * 100.0;
        rolling.busy = Duration::ZERO;
        rolling.since = Instant::now();

        WorkerLoad {
            pending_backlog,
            cpu_pct,
            // Proxy: bounded per-vehicle window occupancy
            mem_pct: (queue_length as f64 / ROLLING_WINDOW_CAP as f64).clamp(0.0, 1.0) * 100.0,
            avg_latency_ms: rolling.avg_latency_ms,
            success_rate: rolling.success_rate,
            queue_length,
        }
    }

    fn health_snapshot(&self) -> (f64, f64) {
        let rolling = self.rolling.lock();
        (rolling.success_rate, rolling.avg_latency_ms)
    }
}

/// One worker: a named consumer in its family's group
pub struct WorkerNode {
    worker_id: String,
    family: FaultFamily,
    analyzer: Box<dyn FaultAnalyzer>,
    bind_address: String,
    options: WorkerOptions,
    metrics: Arc<WorkerMetrics>,
    windows: HashMap<String, RollingWindow>,
    state: WorkerState,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl WorkerNode {
    pub fn new(
        family: FaultFamily,
        ordinal: usize,
        bind_address: String,
        options: WorkerOptions,
    ) -> Self {
        Self {
            worker_id: format!("{}_consumer_{}", family, ordinal),
            family,
            analyzer: analyzers::build(family),
            bind_address,
            options,
            metrics: Arc::new(WorkerMetrics::default()),
            windows: HashMap::new(),
            state: WorkerState::Initializing,
            started_at: chrono::Utc::now(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn metrics(&self) -> Arc<WorkerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Spawn the worker loop. The returned handle completes once the worker
    /// has drained and deregistered. `stop_rx` is the pool's per-worker
    /// drain signal (scale-down); `shutdown_rx` is the cluster-wide one.
    pub fn start(
        mut self,
        broker: BrokerService,
        mut shutdown_rx: watch::Receiver<bool>,
        mut stop_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let raw = broker.stream::<VehicleSample>(STREAM_RAW);
            let results = broker.stream::<FaultScore>(STREAM_RESULTS);
            let heartbeats = broker.stream::<WorkerRegistration>(STREAM_HEARTBEATS);

            self.state = WorkerState::Registering;
            let reader = match raw
                .reader(&self.family.group_name(), &self.worker_id, GroupStart::Earliest)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(worker = %self.worker_id, error = %e, "Failed to join consumer group");
                    return;
                }
            };

            // First heartbeat doubles as registration
            self.state = WorkerState::Running;
            self.publish_heartbeat(&heartbeats, &reader).await;

            tracing::debug!(
                worker = %self.worker_id,
                family = %self.family,
                "Worker started"
            );

            let mut claim_interval = tokio::time::interval(self.options.claim_interval);
            claim_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut heartbeat_interval = tokio::time::interval(self.options.heartbeat_interval);
            heartbeat_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::debug!(worker = %self.worker_id, "Worker draining (shutdown)");
                            break;
                        }
                    }

                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            tracing::debug!(worker = %self.worker_id, "Worker draining (scale-down)");
                            break;
                        }
                    }

                    _ = heartbeat_interval.tick() => {
                        self.refresh_state();
                        self.publish_heartbeat(&heartbeats, &reader).await;
                    }

                    _ = claim_interval.tick() => {
                        self.claim_stale(&reader, &results).await;
                    }

                    batch = reader.read(self.options.read_batch, self.options.read_block_ms) => {
                        match batch {
                            Ok(batch) => {
                                for delivery in batch {
                                    self.process(&reader, &results, delivery).await;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(worker = %self.worker_id, error = %e, "Read failed, backing off");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
            }

            // Drain: in-flight work is per-message here, so simply finish the
            // current batch (done above) and deregister.
            self.state = WorkerState::Draining;
            self.publish_heartbeat(&heartbeats, &reader).await;
            self.state = WorkerState::Stopped;
            self.publish_heartbeat(&heartbeats, &reader).await;
            tracing::debug!(worker = %self.worker_id, "Worker stopped");
        })
    }

    /// Process one delivery end to end: window update, analysis, result
    /// publish, ack. Ack policy encodes the error taxonomy.
    async fn process(
        &mut self,
        reader: &GroupReader<VehicleSample>,
        results: &JsonStream<FaultScore>,
        delivery: Delivery<VehicleSample>,
    ) {
        let started = Instant::now();
        let sample = match delivery.payload {
            Ok(sample) => sample,
            Err(e) => {
                // Malformed payload: poison, ack to discard
                tracing::warn!(
                    worker = %self.worker_id,
                    msg_id = %delivery.id,
                    error = %e,
                    "Malformed sample, dead-lettering"
                );
                self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
                self.metrics.record(started.elapsed(), false);
                self.ack(reader, &delivery.id).await;
                return;
            }
        };

        let window = self
            .windows
            .entry(sample.vehicle_id.clone())
            .or_default();
        window.push(sample.clone());

        match self.analyzer.analyze(&sample, window) {
            Ok(output) => {
                let latency = started.elapsed();
                let score = FaultScore {
                    vehicle_id: sample.vehicle_id.clone(),
                    sample_timestamp: sample.timestamp,
                    family: self.family,
                    severity: output.severity,
                    status: Thresholds::for_family(self.family).band(output.severity),
                    features: output.features,
                    produced_by: self.worker_id.clone(),
                    processing_latency_ms: latency.as_millis() as u64,
                };

                let published = retry_with_backoff(3, 50, || {
                    results.publish(Some(&score.vehicle_id), Some("fault_score"), &score)
                })
                .await;

                match published {
                    Ok(_) => {
                        self.metrics.record(latency, true);
                        self.ack(reader, &delivery.id).await;
                    }
                    Err(e) => {
                        // Leave unacked: claim recovery will redeliver
                        tracing::warn!(
                            worker = %self.worker_id,
                            msg_id = %delivery.id,
                            error = %e,
                            "Result publish failed, leaving sample pending"
                        );
                        self.metrics.transient_failures.fetch_add(1, Ordering::Relaxed);
                        self.metrics.record(latency, false);
                    }
                }
            }
            Err(e) if e.is_poison() => {
                tracing::warn!(
                    worker = %self.worker_id,
                    vehicle = %sample.vehicle_id,
                    msg_id = %delivery.id,
                    error = %e,
                    "Poison sample, dead-lettering"
                );
                self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
                self.metrics.record(started.elapsed(), false);
                self.ack(reader, &delivery.id).await;
            }
            Err(e) => {
                tracing::warn!(
                    worker = %self.worker_id,
                    msg_id = %delivery.id,
                    error = %e,
                    "Transient analyzer failure, leaving sample pending"
                );
                self.metrics.transient_failures.fetch_add(1, Ordering::Relaxed);
                self.metrics.record(started.elapsed(), false);
            }
        }
    }

    async fn ack(&self, reader: &GroupReader<VehicleSample>, id: &str) {
        if let Err(e) = reader.ack_one(id).await {
            tracing::warn!(worker = %self.worker_id, msg_id = %id, error = %e, "Failed to ack");
        }
    }

    /// Claim pending samples abandoned by crashed or evicted peers
    async fn claim_stale(
        &mut self,
        reader: &GroupReader<VehicleSample>,
        results: &JsonStream<FaultScore>,
    ) {
        match reader
            .claim_stale(self.options.claim_min_idle_ms, CLAIM_MAX_COUNT)
            .await
        {
            Ok(claimed) if claimed.is_empty() => {}
            Ok(claimed) => {
                tracing::debug!(
                    worker = %self.worker_id,
                    count = claimed.len(),
                    "Claimed stale samples from peers"
                );
                for delivery in claimed {
                    self.process(reader, results, delivery).await;
                }
            }
            Err(e) => {
                tracing::warn!(worker = %self.worker_id, error = %e, "Claim scan failed");
            }
        }
    }

    /// Degraded when the success rate or latency budget is violated;
    /// recovers once both are back inside
    fn refresh_state(&mut self) {
        let (success_rate, avg_latency_ms) = self.metrics.health_snapshot();
        let degraded = success_rate < DEGRADED_SUCCESS_RATE || avg_latency_ms > DEGRADED_LATENCY_MS;
        self.state = match (self.state, degraded) {
            (WorkerState::Running, true) => {
                tracing::warn!(
                    worker = %self.worker_id,
                    success_rate,
                    avg_latency_ms,
                    "Worker degraded"
                );
                WorkerState::Degraded
            }
            (WorkerState::Degraded, false) => {
                tracing::info!(worker = %self.worker_id, "Worker recovered");
                WorkerState::Running
            }
            (state, _) => state,
        };
    }

    async fn publish_heartbeat(
        &self,
        heartbeats: &JsonStream<WorkerRegistration>,
        reader: &GroupReader<VehicleSample>,
    ) {
        let pending = match reader.pending().await {
            Ok(summary) => summary
                .per_consumer
                .get(&self.worker_id)
                .copied()
                .unwrap_or(0),
            Err(_) => 0,
        };

        let registration = WorkerRegistration {
            worker_id: self.worker_id.clone(),
            families: vec![self.family],
            bind_address: self.bind_address.clone(),
            started_at: self.started_at,
            last_heartbeat: chrono::DateTime::from_timestamp_millis(now_ms())
                .unwrap_or_else(chrono::Utc::now),
            state: self.state,
            load: self.metrics.load_sample(pending, self.windows.len() as u64),
        };

        if let Err(e) = heartbeats
            .publish(None, Some("registration"), &registration)
            .await
        {
            tracing::warn!(worker = %self.worker_id, error = %e, "Heartbeat publish failed");
        }
    }
}
