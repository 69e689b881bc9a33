//! Throughput estimator configuration endpoints
//!
//! The config is live-mutable; a rejected `PUT` leaves the current config
//! unchanged and names the offending field.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::{Json, Router, routing::{get, post}};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::types::ApiError;
use crate::domain::throughput::{ThroughputConfig, ThroughputEstimator};

#[derive(Clone)]
pub struct ConfigState {
    pub estimator: Arc<ThroughputEstimator>,
}

pub fn routes(estimator: Arc<ThroughputEstimator>) -> Router<()> {
    let state = ConfigState { estimator };
    Router::new()
        .route("/throughput", get(get_throughput).put(put_throughput))
        .route("/throughput/reset", post(reset_throughput))
        .route("/throughput/refresh", post(refresh_throughput))
        .route("/throughput/preview", get(preview_throughput))
        .with_state(state)
}

/// Current throughput configuration
#[utoipa::path(
    get,
    path = "/config/throughput",
    tag = "config",
    responses((status = 200, description = "Current configuration", body = ThroughputConfig))
)]
pub async fn get_throughput(State(state): State<ConfigState>) -> Json<ThroughputConfig> {
    Json(state.estimator.config().get())
}

/// Replace the throughput configuration
#[utoipa::path(
    put,
    path = "/config/throughput",
    tag = "config",
    request_body = ThroughputConfig,
    responses(
        (status = 200, description = "Configuration applied", body = ThroughputConfig),
        (status = 400, description = "A parameter is out of range; config unchanged")
    )
)]
pub async fn put_throughput(
    State(state): State<ConfigState>,
    Json(config): Json<ThroughputConfig>,
) -> Result<Json<ThroughputConfig>, ApiError> {
    state
        .estimator
        .config()
        .set(config)
        .await
        .map_err(ApiError::from_validation)?;
    Ok(Json(state.estimator.config().get()))
}

/// Restore default configuration
#[utoipa::path(
    post,
    path = "/config/throughput/reset",
    tag = "config",
    responses((status = 200, description = "Defaults restored", body = ThroughputConfig))
)]
pub async fn reset_throughput(State(state): State<ConfigState>) -> Json<ThroughputConfig> {
    Json(state.estimator.config().reset().await)
}

#[derive(Serialize, ToSchema)]
pub struct RefreshResponse {
    pub message_id: String,
}

/// Publish a heartbeat sentinel to the metrics stream now
#[utoipa::path(
    post,
    path = "/config/throughput/refresh",
    tag = "config",
    responses(
        (status = 200, description = "Sentinel published", body = RefreshResponse),
        (status = 503, description = "Broker unreachable")
    )
)]
pub async fn refresh_throughput(
    State(state): State<ConfigState>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let message_id = state
        .estimator
        .refresh()
        .await
        .map_err(ApiError::from_broker)?;
    Ok(Json(RefreshResponse { message_id }))
}

#[derive(Debug, Deserialize)]
pub struct PreviewQuery {
    pub age_minutes: f64,
}

#[derive(Serialize, ToSchema)]
pub struct PreviewResponse {
    pub age_minutes: f64,
    pub freshness_factor: f64,
}

/// The freshness factor a write of the given age would yield
#[utoipa::path(
    get,
    path = "/config/throughput/preview",
    tag = "config",
    params(("age_minutes" = f64, Query, description = "Hypothetical write age in minutes")),
    responses(
        (status = 200, description = "Curve value for that age", body = PreviewResponse),
        (status = 400, description = "Negative age")
    )
)]
pub async fn preview_throughput(
    State(state): State<ConfigState>,
    Query(query): Query<PreviewQuery>,
) -> Result<Json<PreviewResponse>, ApiError> {
    if !query.age_minutes.is_finite() || query.age_minutes < 0.0 {
        return Err(ApiError::bad_request(
            "INVALID_AGE",
            "age_minutes must be a non-negative number",
        ));
    }
    Ok(Json(PreviewResponse {
        age_minutes: query.age_minutes,
        freshness_factor: state.estimator.preview(query.age_minutes),
    }))
}
