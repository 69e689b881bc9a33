//! OpenAPI document assembly

use axum::Json;
use utoipa::OpenApi;

use super::routes::{alerts, config, health, ingest, system, vehicles};
use crate::api::types::ErrorBody;
use crate::data::types::{
    AlertLevel, FaultFamily, FaultScore, FaultStatus, HealthAssessment, Location, VehicleSample,
    WorkerLoad, WorkerRegistration, WorkerState,
};
use crate::domain::throughput::{DecayCurve, ThroughputConfig, ThroughputEstimate};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "FleetDiag API",
        description = "Distributed real-time motor-fault diagnosis cluster"
    ),
    paths(
        health::health,
        ingest::ingest_sample,
        vehicles::get_health,
        vehicles::get_history,
        alerts::get_critical,
        system::get_status,
        system::get_performance,
        system::post_scale,
        config::get_throughput,
        config::put_throughput,
        config::reset_throughput,
        config::refresh_throughput,
        config::preview_throughput,
    ),
    components(schemas(
        ErrorBody,
        FaultFamily,
        FaultStatus,
        AlertLevel,
        WorkerState,
        Location,
        VehicleSample,
        FaultScore,
        HealthAssessment,
        WorkerLoad,
        WorkerRegistration,
        DecayCurve,
        ThroughputConfig,
        ThroughputEstimate,
        ingest::IngestRequest,
        ingest::IngestResponse,
        vehicles::HistoryResponse,
        alerts::AlertsResponse,
        system::ScaleRequest,
        system::ScaleResponse,
        config::RefreshResponse,
        config::PreviewResponse,
    )),
    tags(
        (name = "health", description = "Liveness"),
        (name = "vehicles", description = "Ingest and per-vehicle queries"),
        (name = "alerts", description = "Critical alert feed"),
        (name = "system", description = "Cluster status and scaling"),
        (name = "config", description = "Throughput estimator configuration"),
    )
)]
pub struct ApiDoc;

/// Serve the OpenAPI document
pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
