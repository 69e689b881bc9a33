//! Classification enums shared across the cluster
//!
//! These enums travel on the broker streams and through the API, so their
//! serialized forms are part of the wire contract.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::core::constants::GROUP_DIAGNOSIS_PREFIX;

// ============================================================================
// FAULT FAMILIES
// ============================================================================

/// The motor fault families the cluster diagnoses.
///
/// Adding a family means adding a variant plus an analyzer implementation;
/// every other component fans out over [`FaultFamily::ALL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FaultFamily {
    TurnFault,
    Insulation,
    Bearing,
    Eccentricity,
    BrokenBar,
}

impl FaultFamily {
    /// All configured families, in canonical order
    pub const ALL: [FaultFamily; 5] = [
        FaultFamily::TurnFault,
        FaultFamily::Insulation,
        FaultFamily::Bearing,
        FaultFamily::Eccentricity,
        FaultFamily::BrokenBar,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TurnFault => "turn_fault",
            Self::Insulation => "insulation",
            Self::Bearing => "bearing",
            Self::Eccentricity => "eccentricity",
            Self::BrokenBar => "broken_bar",
        }
    }

    /// Consumer group name for this family on the raw stream
    pub fn group_name(&self) -> String {
        format!("{}{}", GROUP_DIAGNOSIS_PREFIX, self.as_str())
    }
}

impl fmt::Display for FaultFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FaultFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "turn_fault" => Ok(Self::TurnFault),
            "insulation" => Ok(Self::Insulation),
            "bearing" => Ok(Self::Bearing),
            "eccentricity" => Ok(Self::Eccentricity),
            "broken_bar" => Ok(Self::BrokenBar),
            _ => Err(format!(
                "Unknown fault family '{}'. Valid: turn_fault, insulation, bearing, \
                 eccentricity, broken_bar",
                s
            )),
        }
    }
}

// ============================================================================
// STATUS / ALERT LEVELS
// ============================================================================

/// Per-score and per-vehicle status classification.
///
/// Ordered so that `max()` over statuses yields the worst case.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum FaultStatus {
    #[default]
    Normal,
    Warning,
    Fault,
}

impl FaultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Fault => "fault",
        }
    }
}

impl fmt::Display for FaultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Alert level attached to a health assessment.
///
/// Derived from the composite score plus its rate of change; ordered so
/// `max()` yields the most urgent level.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    #[default]
    None,
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// WORKER LIFECYCLE
// ============================================================================

/// Worker node lifecycle states.
///
/// `Degraded` workers keep consuming but are deprioritized by the
/// coordinator's load scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Initializing,
    Registering,
    Running,
    Degraded,
    Draining,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Registering => "registering",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }

    /// Whether the worker is consuming messages in this state
    pub fn is_consuming(&self) -> bool {
        matches!(self, Self::Running | Self::Degraded)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
