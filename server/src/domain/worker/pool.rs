//! Worker pool
//!
//! Owns the worker tasks for every fault family. The pool is the single
//! consumer of the control stream: scale commands from the autoscaler and
//! from the operator API both arrive there, so resizing converges on one
//! code path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::node::{WorkerMetrics, WorkerNode, WorkerOptions};
use crate::core::constants::{
    GROUP_POOL_CONTROL, MAX_CONSUMERS_PER_FAMILY, MIN_CONSUMERS_PER_FAMILY, STREAM_CONTROL,
    STREAM_RAW,
};
use crate::core::shutdown::ShutdownService;
use crate::data::broker::{BrokerError, BrokerService, GroupStart};
use crate::data::types::{FaultFamily, ScaleCommand, VehicleSample};

/// Handle to one spawned worker
struct WorkerHandle {
    worker_id: String,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    metrics: Arc<WorkerMetrics>,
}

struct PoolState {
    workers: HashMap<FaultFamily, Vec<WorkerHandle>>,
    /// Monotone per-family ordinal so consumer ids never collide, even
    /// after scale-down/up cycles
    next_ordinal: HashMap<FaultFamily, usize>,
}

/// Per-family worker pool
pub struct WorkerPool {
    broker: BrokerService,
    bind_address: String,
    options: WorkerOptions,
    shutdown_rx: watch::Receiver<bool>,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    /// Create the pool, pre-create every family's consumer group, and spawn
    /// the initial workers. Returns once all workers are registering.
    pub async fn start(
        broker: BrokerService,
        bind_address: String,
        workers_per_family: usize,
        options: WorkerOptions,
        shutdown: &ShutdownService,
    ) -> Result<Arc<Self>, BrokerError> {
        let raw = broker.stream::<VehicleSample>(STREAM_RAW);
        for family in FaultFamily::ALL {
            raw.create_group(&family.group_name(), GroupStart::Earliest).await?;
        }

        let pool = Arc::new(Self {
            broker,
            bind_address,
            options,
            shutdown_rx: shutdown.subscribe(),
            state: Mutex::new(PoolState {
                workers: HashMap::new(),
                next_ordinal: HashMap::new(),
            }),
        });

        for family in FaultFamily::ALL {
            pool.apply_scale(family, workers_per_family).await;
        }

        shutdown
            .register(Arc::clone(&pool).run_control_loop(shutdown.subscribe()))
            .await;
        // Workers stay owned by the pool for scale-down; this task hands
        // their joins to the shutdown sequence.
        shutdown
            .register(Arc::clone(&pool).run_drain_on_shutdown(shutdown.subscribe()))
            .await;

        Ok(pool)
    }

    fn run_drain_on_shutdown(
        self: Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let _ = shutdown_rx.wait_for(|&v| v).await;
            let handles: Vec<WorkerHandle> = {
                let mut state = self.state.lock().await;
                state.workers.drain().flat_map(|(_, v)| v).collect()
            };
            let count = handles.len();
            futures::future::join_all(handles.into_iter().map(|w| w.handle)).await;
            tracing::debug!(count, "All workers drained");
        })
    }

    /// Consume scale commands from the control stream
    fn run_control_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let consumer = format!("pool:{}", Uuid::new_v4());
            let reader = match self
                .broker
                .stream::<ScaleCommand>(STREAM_CONTROL)
                .reader(GROUP_POOL_CONTROL, &consumer, GroupStart::Latest)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to subscribe to control stream");
                    return;
                }
            };

            tracing::debug!(consumer = %consumer, "Worker pool control loop started");

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }

                    batch = reader.read(16, 1000) => {
                        let batch = match batch {
                            Ok(batch) => batch,
                            Err(e) => {
                                tracing::warn!(error = %e, "Control read failed, backing off");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                                continue;
                            }
                        };
                        for delivery in batch {
                            match delivery.payload {
                                Ok(command) => {
                                    tracing::info!(
                                        family = %command.family,
                                        target = command.target_consumers,
                                        issued_by = %command.issued_by,
                                        "Applying scale command"
                                    );
                                    self.apply_scale(command.family, command.target_consumers).await;
                                }
                                Err(e) => {
                                    tracing::warn!(
                                        msg_id = %delivery.id,
                                        error = %e,
                                        "Discarding malformed scale command"
                                    );
                                }
                            }
                            if let Err(e) = reader.ack_one(&delivery.id).await {
                                tracing::warn!(error = %e, "Failed to ack scale command");
                            }
                        }
                    }
                }
            }

            tracing::debug!("Worker pool control loop stopped");
        })
    }

    /// Resize a family's pool toward `target` (clamped to the configured
    /// bounds). Scale-down drains the newest worker first.
    pub async fn apply_scale(&self, family: FaultFamily, target: usize) {
        let target = target.clamp(MIN_CONSUMERS_PER_FAMILY, MAX_CONSUMERS_PER_FAMILY);
        let mut state = self.state.lock().await;

        // Reap workers that exited on their own
        let entry = state.workers.entry(family).or_default();
        entry.retain(|w| !w.handle.is_finished());
        let current = entry.len();

        if current < target {
            for _ in current..target {
                let ordinal = {
                    let n = state.next_ordinal.entry(family).or_default();
                    let ordinal = *n;
                    *n += 1;
                    ordinal
                };
                let node = WorkerNode::new(
                    family,
                    ordinal,
                    self.bind_address.clone(),
                    self.options.clone(),
                );
                let worker_id = node.worker_id().to_string();
                let metrics = node.metrics();
                let (stop_tx, stop_rx) = watch::channel(false);
                let handle = node.start(self.broker.clone(), self.shutdown_rx.clone(), stop_rx);
                tracing::info!(family = %family, worker = %worker_id, "Worker added");
                state.workers.entry(family).or_default().push(WorkerHandle {
                    worker_id,
                    stop_tx,
                    handle,
                    metrics,
                });
            }
        } else if current > target {
            let entry = state.workers.entry(family).or_default();
            for handle in entry.drain(target..) {
                tracing::info!(family = %family, worker = %handle.worker_id, "Worker draining");
                let _ = handle.stop_tx.send(true);
                // The worker finishes in-flight messages and deregisters;
                // nothing to await here, shutdown owns the final join.
            }
        }
    }

    /// Live consumer count per family
    pub async fn consumer_counts(&self) -> HashMap<FaultFamily, usize> {
        let mut state = self.state.lock().await;
        let mut counts = HashMap::new();
        for family in FaultFamily::ALL {
            let entry = state.workers.entry(family).or_default();
            entry.retain(|w| !w.handle.is_finished());
            counts.insert(family, entry.len());
        }
        counts
    }

    /// Aggregate dead-letter and failure counters across live workers
    pub async fn counters(&self) -> PoolCounters {
        let state = self.state.lock().await;
        let mut counters = PoolCounters::default();
        for handles in state.workers.values() {
            for worker in handles {
                counters.processed += worker
                    .metrics
                    .processed
                    .load(std::sync::atomic::Ordering::Relaxed);
                counters.dead_lettered += worker
                    .metrics
                    .dead_lettered
                    .load(std::sync::atomic::Ordering::Relaxed);
                counters.transient_failures += worker
                    .metrics
                    .transient_failures
                    .load(std::sync::atomic::Ordering::Relaxed);
            }
        }
        counters
    }
}

/// Cluster-wide worker counters for the status API
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounters {
    pub processed: u64,
    pub dead_lettered: u64,
    pub transient_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::time::now_ms;

    fn test_options() -> WorkerOptions {
        WorkerOptions {
            read_block_ms: 20,
            read_batch: 8,
            claim_interval: Duration::from_millis(100),
            claim_min_idle_ms: 0,
            heartbeat_interval: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_pool_spawns_initial_workers_per_family() {
        let broker = BrokerService::memory();
        let shutdown = ShutdownService::new();
        let pool = WorkerPool::start(broker, "127.0.0.1:0".into(), 2, test_options(), &shutdown)
            .await
            .unwrap();

        let counts = pool.consumer_counts().await;
        for family in FaultFamily::ALL {
            assert_eq!(counts[&family], 2);
        }

        shutdown.shutdown().await;
    }

    #[tokio::test]
    async fn test_scale_command_resizes_pool() {
        let broker = BrokerService::memory();
        let shutdown = ShutdownService::new();
        let pool = WorkerPool::start(
            broker.clone(),
            "127.0.0.1:0".into(),
            1,
            test_options(),
            &shutdown,
        )
        .await
        .unwrap();

        let control = broker.stream::<ScaleCommand>(STREAM_CONTROL);
        control
            .publish(
                None,
                Some("scale"),
                &ScaleCommand {
                    family: FaultFamily::Bearing,
                    target_consumers: 3,
                    issued_by: "test".into(),
                    issued_at: chrono::DateTime::from_timestamp_millis(now_ms()).unwrap(),
                },
            )
            .await
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        loop {
            let counts = pool.consumer_counts().await;
            if counts[&FaultFamily::Bearing] == 3 {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "pool never scaled to 3"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Other families untouched
        assert_eq!(pool.consumer_counts().await[&FaultFamily::Insulation], 1);

        shutdown.shutdown().await;
    }

    #[tokio::test]
    async fn test_scale_down_drains_worker() {
        let broker = BrokerService::memory();
        let shutdown = ShutdownService::new();
        let pool = WorkerPool::start(
            broker.clone(),
            "127.0.0.1:0".into(),
            2,
            test_options(),
            &shutdown,
        )
        .await
        .unwrap();

        pool.apply_scale(FaultFamily::Eccentricity, 1).await;

        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        loop {
            let counts = pool.consumer_counts().await;
            if counts[&FaultFamily::Eccentricity] == 1 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "worker never drained");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        shutdown.shutdown().await;
    }

    #[tokio::test]
    async fn test_scale_clamps_to_bounds() {
        let broker = BrokerService::memory();
        let shutdown = ShutdownService::new();
        let pool = WorkerPool::start(broker, "127.0.0.1:0".into(), 1, test_options(), &shutdown)
            .await
            .unwrap();

        pool.apply_scale(FaultFamily::Bearing, 0).await;
        assert_eq!(
            pool.consumer_counts().await[&FaultFamily::Bearing],
            MIN_CONSUMERS_PER_FAMILY
        );

        pool.apply_scale(FaultFamily::Bearing, 1000).await;
        assert_eq!(
            pool.consumer_counts().await[&FaultFamily::Bearing],
            MAX_CONSUMERS_PER_FAMILY
        );

        shutdown.shutdown().await;
    }
}
