//! Cluster status, performance, and operator scaling

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Json, Router, routing::{get, post}};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::types::ApiError;
use crate::core::config::ClusterConfig;
use crate::core::constants::{
    GROUP_AGGREGATION, GROUP_BRIDGE_HEALTH, MAX_CONSUMERS_PER_FAMILY, STREAM_CONTROL,
    STREAM_HEALTH, STREAM_RAW, STREAM_RESULTS,
};
use crate::data::broker::BrokerService;
use crate::data::types::{FaultFamily, ScaleCommand, WorkerState};
use crate::domain::aggregator::AggregatorState;
use crate::domain::bridge::BridgeState;
use crate::domain::coordinator::{CoordinatorState, load_score};
use crate::domain::throughput::{ThroughputEstimate, ThroughputEstimator};
use crate::domain::worker::WorkerPool;

#[derive(Clone)]
pub struct SystemState {
    pub broker: BrokerService,
    pub cluster: ClusterConfig,
    pub coordinator: Arc<CoordinatorState>,
    pub aggregator: Arc<AggregatorState>,
    pub bridge: Arc<BridgeState>,
    pub pool: Option<Arc<WorkerPool>>,
    pub estimator: Arc<ThroughputEstimator>,
    pub started_at: Instant,
}

pub fn routes(state: SystemState) -> Router<()> {
    Router::new()
        .route("/status", get(get_status))
        .route("/performance", get(get_performance))
        .route("/scale", post(post_scale))
        .with_state(state)
}

// ============================================================================
// STATUS
// ============================================================================

#[derive(Serialize, ToSchema)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub families: Vec<FaultFamily>,
    pub state: WorkerState,
    pub load_score: f64,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Serialize, ToSchema)]
pub struct StreamSummary {
    pub length: u64,
    pub pending: u64,
    pub consumers: u64,
}

#[derive(Serialize, ToSchema)]
pub struct SystemCounters {
    pub samples_processed: u64,
    pub dead_lettered: u64,
    pub transient_failures: u64,
    pub assessments_published: u64,
    pub aggregator_dead_lettered: u64,
    pub worker_evictions: u64,
    pub orphaned_pending: u64,
    pub scale_events: u64,
    pub suppressed_registrations: u64,
    pub bridge_pushed: u64,
    pub bridge_deduped: u64,
    pub bridge_dropped: u64,
    pub bridge_disconnected: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

#[derive(Serialize, ToSchema)]
pub struct SystemStatusResponse {
    /// "ok" or "degraded" (coordinator operating on its fallback snapshot)
    pub status: &'static str,
    pub mode: String,
    pub broker_backend: &'static str,
    pub cluster_enabled: bool,
    pub uptime_seconds: u64,
    pub vehicles_assessed: usize,
    pub subscribers: usize,
    pub workers: Vec<WorkerSummary>,
    pub consumers_per_family: BTreeMap<FaultFamily, usize>,
    /// Advisory routing: best-scoring worker per family right now
    pub advised_workers: BTreeMap<FaultFamily, Option<String>>,
    pub counters: SystemCounters,
    pub streams: BTreeMap<String, StreamSummary>,
}

/// Cluster-wide status and counters
#[utoipa::path(
    get,
    path = "/system/status",
    tag = "system",
    responses((status = 200, description = "Cluster status", body = SystemStatusResponse))
)]
pub async fn get_status(
    State(state): State<SystemState>,
) -> Result<Json<SystemStatusResponse>, ApiError> {
    let workers: Vec<WorkerSummary> = state
        .coordinator
        .workers()
        .into_iter()
        .map(|w| WorkerSummary {
            load_score: load_score(&w),
            worker_id: w.worker_id,
            families: w.families,
            state: w.state,
            last_heartbeat: w.last_heartbeat,
        })
        .collect();

    let consumers_per_family = match &state.pool {
        Some(pool) => pool
            .consumer_counts()
            .await
            .into_iter()
            .collect::<BTreeMap<_, _>>(),
        None => BTreeMap::new(),
    };

    let mut advised_workers = BTreeMap::new();
    for family in FaultFamily::ALL {
        advised_workers.insert(
            family,
            state
                .coordinator
                .advise_worker(family)
                .map(|w| w.worker_id),
        );
    }

    let pool_counters = match &state.pool {
        Some(pool) => pool.counters().await,
        None => Default::default(),
    };
    let cache = state.bridge.cache_stats();

    let mut streams = BTreeMap::new();
    for (stream, group) in [
        (STREAM_RAW, FaultFamily::TurnFault.group_name()),
        (STREAM_RESULTS, GROUP_AGGREGATION.to_string()),
        (STREAM_HEALTH, GROUP_BRIDGE_HEALTH.to_string()),
    ] {
        let stats = state
            .broker
            .stats(stream, &group)
            .await
            .map_err(ApiError::from_broker)?;
        streams.insert(
            stream.to_string(),
            StreamSummary {
                length: stats.length,
                pending: stats.pending,
                consumers: stats.consumers,
            },
        );
    }
    // Per-family raw backlog, the autoscaler's input
    for family in FaultFamily::ALL {
        let stats = state
            .broker
            .stats(STREAM_RAW, &family.group_name())
            .await
            .map_err(ApiError::from_broker)?;
        streams.insert(
            format!("{}:{}", STREAM_RAW, family.group_name()),
            StreamSummary {
                length: stats.length,
                pending: stats.pending,
                consumers: stats.consumers,
            },
        );
    }
    use std::sync::atomic::Ordering;
    let counters = SystemCounters {
        samples_processed: pool_counters.processed,
        dead_lettered: pool_counters.dead_lettered,
        transient_failures: pool_counters.transient_failures,
        assessments_published: state.aggregator.assessed.load(Ordering::Relaxed),
        aggregator_dead_lettered: state.aggregator.dead_lettered.load(Ordering::Relaxed),
        worker_evictions: state.coordinator.evictions(),
        orphaned_pending: state.coordinator.orphaned_pending.load(Ordering::Relaxed),
        scale_events: state.coordinator.scale_events.load(Ordering::Relaxed),
        suppressed_registrations: state
            .coordinator
            .suppressed_registrations
            .load(Ordering::Relaxed),
        bridge_pushed: state.bridge.pushed.load(Ordering::Relaxed),
        bridge_deduped: state.bridge.deduped.load(Ordering::Relaxed),
        bridge_dropped: state.bridge.total_dropped(),
        bridge_disconnected: state.bridge.disconnected.load(Ordering::Relaxed),
        cache_hits: cache.hits,
        cache_misses: cache.misses,
    };

    Ok(Json(SystemStatusResponse {
        status: if state.coordinator.is_degraded() {
            "degraded"
        } else {
            "ok"
        },
        mode: state.cluster.mode.to_string(),
        broker_backend: state.broker.backend_name(),
        cluster_enabled: state.cluster.enabled,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        vehicles_assessed: state.aggregator.vehicle_count(),
        subscribers: state.bridge.session_count(),
        workers,
        consumers_per_family,
        advised_workers,
        counters,
        streams,
    }))
}

// ============================================================================
// PERFORMANCE
// ============================================================================

/// Freshness-weighted throughput estimate
#[utoipa::path(
    get,
    path = "/system/performance",
    tag = "system",
    responses((status = 200, description = "Current throughput estimate", body = ThroughputEstimate))
)]
pub async fn get_performance(
    State(state): State<SystemState>,
) -> Result<Json<ThroughputEstimate>, ApiError> {
    state
        .estimator
        .estimate()
        .await
        .map(Json)
        .map_err(ApiError::from_broker)
}

// ============================================================================
// SCALE
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct ScaleRequest {
    pub family: FaultFamily,
    pub new_count: usize,
}

#[derive(Serialize, ToSchema)]
pub struct ScaleResponse {
    pub family: FaultFamily,
    pub target_consumers: usize,
    pub command_id: String,
}

/// Resize a family's consumer pool via the control stream
#[utoipa::path(
    post,
    path = "/system/scale",
    tag = "system",
    responses(
        (status = 202, description = "Scale command published", body = ScaleResponse),
        (status = 400, description = "Target out of range"),
        (status = 503, description = "Broker unreachable")
    )
)]
pub async fn post_scale(
    State(state): State<SystemState>,
    Json(request): Json<ScaleRequest>,
) -> Result<(StatusCode, Json<ScaleResponse>), ApiError> {
    if request.new_count == 0 || request.new_count > MAX_CONSUMERS_PER_FAMILY {
        return Err(ApiError::bad_request(
            "OUT_OF_RANGE",
            format!(
                "new_count must be between 1 and {}",
                MAX_CONSUMERS_PER_FAMILY
            ),
        ));
    }

    let command = ScaleCommand {
        family: request.family,
        target_consumers: request.new_count,
        issued_by: "operator".into(),
        issued_at: Utc::now(),
    };
    let command_id = state
        .broker
        .stream::<ScaleCommand>(STREAM_CONTROL)
        .publish(None, Some("scale"), &command)
        .await
        .map_err(ApiError::from_broker)?;

    tracing::info!(family = %request.family, target = request.new_count, "Operator scale command published");

    Ok((
        StatusCode::ACCEPTED,
        Json(ScaleResponse {
            family: request.family,
            target_consumers: request.new_count,
            command_id,
        }),
    ))
}
