//! Vehicle query endpoints: latest health and bounded score history

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::{Json, Router, routing::get};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::types::ApiError;
use crate::core::constants::STREAM_RESULTS;
use crate::data::broker::BrokerService;
use crate::data::types::{FaultFamily, FaultScore, HealthAssessment};
use crate::domain::aggregator::AggregatorState;
use crate::utils::time::now_ms;

/// Hard cap on entries scanned from the results stream per history query
const HISTORY_SCAN_LIMIT: usize = 10_000;

/// Hard cap on history rows returned
const HISTORY_RESULT_LIMIT: usize = 1_000;

/// Longest history window (bounded by stream retention anyway)
const HISTORY_MAX_HOURS: u32 = 168;

#[derive(Clone)]
pub struct VehiclesState {
    pub broker: BrokerService,
    pub aggregator: Arc<AggregatorState>,
}

pub fn routes(broker: BrokerService, aggregator: Arc<AggregatorState>) -> Router<()> {
    let state = VehiclesState { broker, aggregator };
    Router::new()
        .route("/{id}/health", get(get_health))
        .route("/{id}/history", get(get_history))
        .with_state(state)
}

/// Latest health assessment for a vehicle
#[utoipa::path(
    get,
    path = "/vehicles/{id}/health",
    tag = "vehicles",
    responses(
        (status = 200, description = "Latest assessment", body = HealthAssessment),
        (status = 404, description = "Vehicle has no assessment yet")
    )
)]
pub async fn get_health(
    State(state): State<VehiclesState>,
    Path(vehicle_id): Path<String>,
) -> Result<Json<HealthAssessment>, ApiError> {
    state
        .aggregator
        .latest_for(&vehicle_id)
        .map(Json)
        .ok_or_else(|| {
            ApiError::not_found(
                "VEHICLE_NOT_ASSESSED",
                format!("No health assessment for vehicle '{}'", vehicle_id),
            )
        })
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub family: Option<String>,
    pub hours: Option<u32>,
}

#[derive(Serialize, ToSchema)]
pub struct HistoryResponse {
    pub vehicle_id: String,
    pub hours: u32,
    pub scores: Vec<FaultScore>,
}

/// Recent fault scores for a vehicle, bounded by stream retention
#[utoipa::path(
    get,
    path = "/vehicles/{id}/history",
    tag = "vehicles",
    params(
        ("family" = Option<String>, Query, description = "Restrict to one fault family"),
        ("hours" = Option<u32>, Query, description = "Lookback window, default 24")
    ),
    responses(
        (status = 200, description = "Score history, oldest first", body = HistoryResponse),
        (status = 400, description = "Unknown fault family")
    )
)]
pub async fn get_history(
    State(state): State<VehiclesState>,
    Path(vehicle_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let family = query
        .family
        .as_deref()
        .map(|f| {
            f.parse::<FaultFamily>()
                .map_err(|e| ApiError::bad_request("INVALID_FAMILY", e))
        })
        .transpose()?;
    let hours = query.hours.unwrap_or(24).clamp(1, HISTORY_MAX_HOURS);

    let since_ms = now_ms() - (hours as i64) * 3_600_000;
    let deliveries = state
        .broker
        .stream::<FaultScore>(STREAM_RESULTS)
        .read_range(since_ms, HISTORY_SCAN_LIMIT)
        .await
        .map_err(ApiError::from_broker)?;

    let scores: Vec<FaultScore> = deliveries
        .into_iter()
        .filter_map(|d| d.payload.ok())
        .filter(|s| s.vehicle_id == vehicle_id)
        .filter(|s| family.is_none_or(|f| s.family == f))
        .take(HISTORY_RESULT_LIMIT)
        .collect();

    Ok(Json(HistoryResponse {
        vehicle_id,
        hours,
        scores,
    }))
}
