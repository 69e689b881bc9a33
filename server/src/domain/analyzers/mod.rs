//! Fault analyzer plugins
//!
//! One analyzer per fault family. Analyzers are pure compute: a sample plus
//! the vehicle's rolling window in, a severity plus diagnostic features out.
//! No I/O, no shared state; the worker owns the window and the publishing.
//!
//! Severity maps to status through per-family threshold bands
//! (`severity < warn -> normal`, `< fault -> warning`, else `fault`).

mod bearing;
mod broken_bar;
mod eccentricity;
mod insulation;
mod turn_fault;
mod window;

use std::collections::BTreeMap;

use thiserror::Error;

pub use bearing::BearingAnalyzer;
pub use broken_bar::BrokenBarAnalyzer;
pub use eccentricity::EccentricityAnalyzer;
pub use insulation::InsulationAnalyzer;
pub use turn_fault::TurnFaultAnalyzer;
pub use window::RollingWindow;

use crate::data::types::{FaultFamily, FaultStatus, VehicleSample};

// ============================================================================
// ANALYZER CONTRACT
// ============================================================================

/// Analyzer failure classification.
///
/// Poison failures are deterministic for the sample: the worker acks the
/// message and bumps its dead-letter counter so the sample is never
/// redelivered. Transient failures leave the message unacked for claim-based
/// recovery.
#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("poison sample: {0}")]
    Poison(String),

    #[error("transient failure: {0}")]
    Transient(String),
}

impl AnalyzerError {
    pub fn is_poison(&self) -> bool {
        matches!(self, Self::Poison(_))
    }
}

/// Severity plus the raw features that justify it
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerOutput {
    /// Severity in [0, 1]
    pub severity: f64,
    pub features: BTreeMap<String, f64>,
}

/// A fault-family analyzer. Pure and side-effect-free.
pub trait FaultAnalyzer: Send + Sync {
    fn family(&self) -> FaultFamily;

    fn analyze(
        &self,
        sample: &VehicleSample,
        window: &RollingWindow,
    ) -> Result<AnalyzerOutput, AnalyzerError>;
}

/// Construct the analyzer for a family
pub fn build(family: FaultFamily) -> Box<dyn FaultAnalyzer> {
    match family {
        FaultFamily::TurnFault => Box::new(TurnFaultAnalyzer),
        FaultFamily::Insulation => Box::new(InsulationAnalyzer),
        FaultFamily::Bearing => Box::new(BearingAnalyzer),
        FaultFamily::Eccentricity => Box::new(EccentricityAnalyzer),
        FaultFamily::BrokenBar => Box::new(BrokenBarAnalyzer),
    }
}

// ============================================================================
// STATUS BANDING
// ============================================================================

/// Per-family severity thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub warn: f64,
    pub fault: f64,
}

impl Thresholds {
    /// Configured thresholds for a family
    pub fn for_family(family: FaultFamily) -> Self {
        match family {
            FaultFamily::TurnFault => Self { warn: 0.30, fault: 0.60 },
            FaultFamily::Insulation => Self { warn: 0.35, fault: 0.70 },
            FaultFamily::Bearing => Self { warn: 0.30, fault: 0.65 },
            FaultFamily::Eccentricity => Self { warn: 0.35, fault: 0.65 },
            FaultFamily::BrokenBar => Self { warn: 0.30, fault: 0.60 },
        }
    }

    /// Map a severity into its status band
    pub fn band(&self, severity: f64) -> FaultStatus {
        if severity < self.warn {
            FaultStatus::Normal
        } else if severity < self.fault {
            FaultStatus::Warning
        } else {
            FaultStatus::Fault
        }
    }
}

// ============================================================================
// SHARED SIGNAL HELPERS
// ============================================================================

/// Nominal synchronous speed (rpm) for the fleet's 4-pole / 50 Hz motors
pub(crate) const SYNC_SPEED_RPM: f64 = 1500.0;

/// Reference winding temperature (°C) for thermal ratios
pub(crate) const REFERENCE_WINDING_TEMP: f64 = 90.0;

/// Reject samples carrying non-finite readings
pub(crate) fn validate_finite(sample: &VehicleSample) -> Result<(), AnalyzerError> {
    let finite = sample.currents.iter().all(|c| c.is_finite())
        && sample.voltage.is_finite()
        && sample.speed.is_finite()
        && sample.torque.is_finite()
        && sample.temperature.is_finite();
    if finite {
        Ok(())
    } else {
        Err(AnalyzerError::Poison("non-finite sensor reading".into()))
    }
}

/// Mean of the three phase currents
pub(crate) fn mean_current(sample: &VehicleSample) -> f64 {
    sample.currents.iter().sum::<f64>() / 3.0
}

/// Worst per-phase deviation from the mean, relative to the mean.
/// Returns 0 when excitation is (numerically) absent.
pub(crate) fn phase_unbalance(sample: &VehicleSample) -> f64 {
    let mean = mean_current(sample);
    if mean.abs() < f64::EPSILON {
        return 0.0;
    }
    sample
        .currents
        .iter()
        .map(|c| (c - mean).abs())
        .fold(0.0_f64, f64::max)
        / mean.abs()
}

/// Electrical input power estimate (W)
pub(crate) fn electrical_power(sample: &VehicleSample) -> f64 {
    3.0_f64.sqrt() * sample.voltage * mean_current(sample)
}

/// Mechanical output power (W) from torque and shaft speed
pub(crate) fn mechanical_power(sample: &VehicleSample) -> f64 {
    sample.torque * sample.speed * std::f64::consts::TAU / 60.0
}

/// Residual between expected and observed efficiency, in [0, 1].
/// Healthy machines sit near the nominal efficiency; a growing residual
/// indicates power lost inside the machine.
pub(crate) fn efficiency_residual(sample: &VehicleSample) -> f64 {
    const NOMINAL_EFFICIENCY: f64 = 0.9;
    let elec = electrical_power(sample);
    if elec.abs() < 1.0 {
        return 0.0;
    }
    let eff = (mechanical_power(sample) / elec).clamp(0.0, 1.0);
    ((NOMINAL_EFFICIENCY - eff) / NOMINAL_EFFICIENCY).clamp(0.0, 1.0)
}

/// Clamp a raw indicator into [0, 1] severity space
pub(crate) fn clamp_severity(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{TimeZone, Utc};

    use super::*;

    /// A healthy steady-state sample
    pub fn healthy_sample(secs: i64) -> VehicleSample {
        VehicleSample {
            vehicle_id: "V1".into(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            currents: [10.0, 10.05, 9.95],
            voltage: 380.0,
            speed: 1450.0,
            torque: 52.0,
            temperature: 62.0,
            location: None,
            metadata: None,
        }
    }

    /// A window pre-filled with healthy samples
    pub fn healthy_window(len: usize) -> RollingWindow {
        let mut window = RollingWindow::default();
        for i in 0..len {
            window.push(healthy_sample(1_700_000_000 + i as i64));
        }
        window
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_banding_is_strict_at_boundaries() {
        let thresholds = Thresholds { warn: 0.3, fault: 0.6 };
        assert_eq!(thresholds.band(0.29), FaultStatus::Normal);
        assert_eq!(thresholds.band(0.30), FaultStatus::Warning);
        assert_eq!(thresholds.band(0.59), FaultStatus::Warning);
        assert_eq!(thresholds.band(0.60), FaultStatus::Fault);
    }

    #[test]
    fn test_build_covers_all_families() {
        for family in FaultFamily::ALL {
            assert_eq!(build(family).family(), family);
        }
    }

    #[test]
    fn test_validate_finite_rejects_nan() {
        let mut sample = healthy_sample(1_700_000_000);
        sample.currents[1] = f64::NAN;
        assert!(validate_finite(&sample).unwrap_err().is_poison());
    }

    #[test]
    fn test_phase_unbalance_of_balanced_sample_is_small() {
        let sample = healthy_sample(1_700_000_000);
        assert!(phase_unbalance(&sample) < 0.01);
    }

    #[test]
    fn test_every_analyzer_scores_healthy_sample_normal() {
        let sample = healthy_sample(1_700_000_100);
        let window = healthy_window(20);
        for family in FaultFamily::ALL {
            let analyzer = build(family);
            let output = analyzer.analyze(&sample, &window).unwrap();
            assert!(
                Thresholds::for_family(family).band(output.severity) == FaultStatus::Normal,
                "{} scored {} on a healthy sample",
                family,
                output.severity
            );
        }
    }

    #[test]
    fn test_analyzers_are_deterministic() {
        let sample = healthy_sample(1_700_000_100);
        let window = healthy_window(20);
        for family in FaultFamily::ALL {
            let analyzer = build(family);
            let a = analyzer.analyze(&sample, &window).unwrap();
            let b = analyzer.analyze(&sample, &window).unwrap();
            assert_eq!(a, b);
        }
    }
}
