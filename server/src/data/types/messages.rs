//! Stream message types
//!
//! Payload bodies carried on the broker streams. All are immutable snapshots:
//! a value is created once, published, and never mutated in place.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::enums::{AlertLevel, FaultFamily, FaultStatus, WorkerState};

// ============================================================================
// SENSOR SAMPLES
// ============================================================================

/// Optional GPS fix attached to a sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// One motor telemetry sample from a vehicle.
///
/// `timestamp` is monotone-non-decreasing per vehicle in publish order; the
/// ingest endpoint enforces nothing, downstream consumers tolerate equal
/// timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct VehicleSample {
    pub vehicle_id: String,
    pub timestamp: DateTime<Utc>,
    /// Three-phase currents (A), phases a/b/c
    pub currents: [f64; 3],
    /// Supply voltage (V)
    pub voltage: f64,
    /// Shaft speed (rpm)
    pub speed: f64,
    /// Shaft torque (Nm)
    pub torque: f64,
    /// Winding temperature (°C)
    pub temperature: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

// ============================================================================
// DIAGNOSIS RESULTS
// ============================================================================

/// Per-family diagnosis result produced by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct FaultScore {
    pub vehicle_id: String,
    /// Timestamp of the source sample (not of the analysis)
    pub sample_timestamp: DateTime<Utc>,
    pub family: FaultFamily,
    /// Severity in [0, 1]
    pub severity: f64,
    pub status: FaultStatus,
    /// Raw diagnostic features backing the severity
    pub features: BTreeMap<String, f64>,
    pub produced_by: String,
    pub processing_latency_ms: u64,
}

/// Composite per-vehicle health snapshot published by the aggregator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HealthAssessment {
    pub vehicle_id: String,
    pub assessed_at: DateTime<Utc>,
    /// Most recent score per family, pruned to the freshness window
    pub per_family_scores: BTreeMap<FaultFamily, FaultScore>,
    /// Worst-case severity across the families present
    pub composite_score: f64,
    pub overall_status: FaultStatus,
    pub alert_level: AlertLevel,
}

// ============================================================================
// WORKER REGISTRY
// ============================================================================

/// Load sample reported with each worker heartbeat
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct WorkerLoad {
    pub pending_backlog: u64,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub avg_latency_ms: f64,
    pub success_rate: f64,
    pub queue_length: u64,
}

/// Heartbeat-refreshed registration entry for a worker node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub families: Vec<FaultFamily>,
    pub bind_address: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub state: WorkerState,
    pub load: WorkerLoad,
}

// ============================================================================
// CONTROL PLANE
// ============================================================================

/// Scale command on the control stream.
///
/// Both the autoscaler and the `POST /system/scale` endpoint publish these;
/// the worker pool is the single consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ScaleCommand {
    pub family: FaultFamily,
    pub target_consumers: usize,
    pub issued_by: String,
    pub issued_at: DateTime<Utc>,
}

/// Heartbeat sentinel published to the metrics stream so the throughput
/// freshness factor cannot decay to its floor while the system is merely
/// quiescent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSentinel {
    pub source: String,
    pub emitted_at: DateTime<Utc>,
}

// ============================================================================
// SUBSCRIBER PUSH
// ============================================================================

/// Self-describing message pushed to bridge subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    FaultScore(FaultScore),
    HealthAssessment(HealthAssessment),
}

impl PushMessage {
    pub fn vehicle_id(&self) -> &str {
        match self {
            Self::FaultScore(s) => &s.vehicle_id,
            Self::HealthAssessment(h) => &h.vehicle_id,
        }
    }

    /// Status carried by the message, used for consecutive-status dedup
    pub fn status(&self) -> FaultStatus {
        match self {
            Self::FaultScore(s) => s.status,
            Self::HealthAssessment(h) => h.overall_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_score(family: FaultFamily, severity: f64) -> FaultScore {
        FaultScore {
            vehicle_id: "V1".into(),
            sample_timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            family,
            severity,
            status: FaultStatus::Normal,
            features: BTreeMap::new(),
            produced_by: "bearing_consumer_0".into(),
            processing_latency_ms: 3,
        }
    }

    #[test]
    fn test_push_message_is_type_discriminated() {
        let msg = PushMessage::FaultScore(sample_score(FaultFamily::Bearing, 0.1));
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "fault_score");
        assert_eq!(json["vehicle_id"], "V1");
    }

    #[test]
    fn test_health_assessment_family_keys_serialize_as_strings() {
        let mut per_family = BTreeMap::new();
        per_family.insert(FaultFamily::TurnFault, sample_score(FaultFamily::TurnFault, 0.2));
        let health = HealthAssessment {
            vehicle_id: "V1".into(),
            assessed_at: Utc.timestamp_opt(1_700_000_100, 0).unwrap(),
            per_family_scores: per_family,
            composite_score: 0.2,
            overall_status: FaultStatus::Normal,
            alert_level: AlertLevel::None,
        };
        let json: serde_json::Value = serde_json::to_value(&health).unwrap();
        assert!(json["per_family_scores"]["turn_fault"].is_object());

        let back: HealthAssessment = serde_json::from_value(json).unwrap();
        assert_eq!(back, health);
    }

    #[test]
    fn test_sample_optional_fields_omitted() {
        let sample = VehicleSample {
            vehicle_id: "V1".into(),
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            currents: [10.0, 10.05, 9.95],
            voltage: 380.0,
            speed: 1480.0,
            torque: 45.0,
            temperature: 62.0,
            location: None,
            metadata: None,
        };
        let json = serde_json::to_string(&sample).unwrap();
        assert!(!json.contains("location"));
        assert!(!json.contains("metadata"));
    }
}
