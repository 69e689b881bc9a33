//! Telemetry ingest endpoint
//!
//! `POST /vehicles/{id}/data` publishes a sample to the raw stream. The
//! accept contract: 202 once the sample is on the stream, 429 when the
//! cluster is shedding load, 503 when the broker is unreachable. A sample is
//! either appended or the call fails; there is no silent drop.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Json, Router, routing::post};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::types::ApiError;
use crate::core::constants::{PENDING_HARD_CEILING, STREAM_RAW};
use crate::data::broker::BrokerService;
use crate::data::types::{FaultFamily, Location, VehicleSample};
use crate::utils::time::{now_ms, parse_flexible_timestamp};

/// How long one backpressure probe stays valid
const THROTTLE_CHECK_TTL_MS: i64 = 500;

/// Cached backpressure verdict so ingest does not inspect every group's
/// pending list on every request
#[derive(Debug, Default)]
struct ThrottleCache {
    checked_at_ms: i64,
    throttled: bool,
}

#[derive(Clone)]
pub struct IngestState {
    pub broker: BrokerService,
    throttle: Arc<Mutex<ThrottleCache>>,
}

pub fn routes(broker: BrokerService) -> Router<()> {
    let state = IngestState {
        broker,
        throttle: Arc::new(Mutex::new(ThrottleCache::default())),
    };
    Router::new()
        .route("/{id}/data", post(ingest_sample))
        .with_state(state)
}

/// Sensor readings in the ingest body
#[derive(Debug, Deserialize, ToSchema)]
pub struct SensorData {
    /// Sample timestamp, RFC 3339 or epoch seconds; defaults to now
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
    pub currents: [f64; 3],
    pub voltage: f64,
    pub speed: f64,
    pub torque: f64,
    pub temperature: f64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct IngestRequest {
    pub sensor_data: SensorData,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Serialize, ToSchema)]
pub struct IngestResponse {
    pub message_id: String,
    pub published_at: DateTime<Utc>,
}

/// Ingest one telemetry sample
#[utoipa::path(
    post,
    path = "/vehicles/{id}/data",
    tag = "vehicles",
    responses(
        (status = 202, description = "Sample accepted onto the raw stream", body = IngestResponse),
        (status = 429, description = "Cluster is shedding load"),
        (status = 503, description = "Broker unreachable")
    )
)]
pub async fn ingest_sample(
    State(state): State<IngestState>,
    Path(vehicle_id): Path<String>,
    Json(request): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    if vehicle_id.is_empty() || vehicle_id.len() > 128 {
        return Err(ApiError::bad_request("INVALID_VEHICLE_ID", "Vehicle id must be 1-128 chars"));
    }

    if is_throttled(&state).await? {
        return Err(ApiError::throttled("Diagnosis backlog at hard ceiling"));
    }

    let timestamp = match &request.sensor_data.timestamp {
        None => Utc::now(),
        Some(value) => parse_timestamp_value(value).ok_or_else(|| {
            ApiError::bad_request(
                "INVALID_TIMESTAMP",
                "timestamp must be RFC 3339 or epoch seconds",
            )
        })?,
    };

    let sample = VehicleSample {
        vehicle_id: vehicle_id.clone(),
        timestamp,
        currents: request.sensor_data.currents,
        voltage: request.sensor_data.voltage,
        speed: request.sensor_data.speed,
        torque: request.sensor_data.torque,
        temperature: request.sensor_data.temperature,
        location: request.location,
        metadata: request.metadata,
    };

    let message_id = state
        .broker
        .stream::<VehicleSample>(STREAM_RAW)
        .publish(Some(&vehicle_id), Some("sensor"), &sample)
        .await
        .map_err(ApiError::from_broker)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            message_id,
            published_at: Utc::now(),
        }),
    ))
}

fn parse_timestamp_value(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => parse_flexible_timestamp(s),
        serde_json::Value::Number(n) => {
            let secs = n.as_f64()?;
            DateTime::from_timestamp_millis((secs * 1000.0) as i64)
        }
        _ => None,
    }
}

/// Backpressure probe: the worst family backlog against the hard ceiling,
/// cached briefly
async fn is_throttled(state: &IngestState) -> Result<bool, ApiError> {
    let now = now_ms();
    {
        let cache = state.throttle.lock();
        if now - cache.checked_at_ms < THROTTLE_CHECK_TTL_MS {
            return Ok(cache.throttled);
        }
    }

    let mut worst = 0u64;
    for family in FaultFamily::ALL {
        let stats = state
            .broker
            .stats(STREAM_RAW, &family.group_name())
            .await
            .map_err(ApiError::from_broker)?;
        worst = worst.max(stats.pending);
    }

    let throttled = worst > PENDING_HARD_CEILING;
    let mut cache = state.throttle.lock();
    cache.checked_at_ms = now;
    cache.throttled = throttled;
    Ok(throttled)
}
