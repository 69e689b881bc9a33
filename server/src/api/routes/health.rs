//! Health check endpoint

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;
use utoipa::ToSchema;

use crate::data::broker::BrokerService;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub broker: &'static str,
}

/// Liveness probe; degrades to 503 when the broker is unreachable
#[utoipa::path(
    get,
    path = "/api/v1/health",
    tag = "health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Broker unreachable")
    )
)]
pub async fn health(State(broker): State<BrokerService>) -> impl IntoResponse {
    match broker.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                version: env!("CARGO_PKG_VERSION"),
                broker: broker.backend_name(),
            }),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "broker_unreachable",
                version: env!("CARGO_PKG_VERSION"),
                broker: broker.backend_name(),
            }),
        ),
    }
}
