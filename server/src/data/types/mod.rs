//! Shared data types
//!
//! Wire-level enums and message bodies used across the broker, domain
//! components, and the API.

mod enums;
mod messages;

pub use enums::{AlertLevel, FaultFamily, FaultStatus, WorkerState};
pub use messages::{
    FaultScore, HealthAssessment, Location, MetricsSentinel, PushMessage, ScaleCommand,
    VehicleSample, WorkerLoad, WorkerRegistration,
};
