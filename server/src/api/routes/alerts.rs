//! Critical alert feed

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::{Json, Router, routing::get};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::data::types::HealthAssessment;
use crate::domain::aggregator::AggregatorState;

/// Default and hard maximum for the alert feed
const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AlertsState {
    pub aggregator: Arc<AggregatorState>,
}

pub fn routes(aggregator: Arc<AggregatorState>) -> Router<()> {
    Router::new()
        .route("/critical", get(get_critical))
        .with_state(AlertsState { aggregator })
}

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    pub limit: Option<usize>,
}

#[derive(Serialize, ToSchema)]
pub struct AlertsResponse {
    pub count: usize,
    pub alerts: Vec<HealthAssessment>,
}

/// Most recent critical health assessments, newest first
#[utoipa::path(
    get,
    path = "/alerts/critical",
    tag = "alerts",
    params(("limit" = Option<usize>, Query, description = "Maximum alerts returned")),
    responses((status = 200, description = "Recent critical assessments", body = AlertsResponse))
)]
pub async fn get_critical(
    State(state): State<AlertsState>,
    Query(query): Query<AlertsQuery>,
) -> Json<AlertsResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let alerts = state.aggregator.recent_critical(limit);
    Json(AlertsResponse {
        count: alerts.len(),
        alerts,
    })
}
