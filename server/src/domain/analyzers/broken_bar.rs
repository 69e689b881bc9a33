//! Broken rotor bar analyzer
//!
//! A cracked rotor bar modulates the stator current at twice the slip
//! frequency. With magnitude-only telemetry the sideband amplitude is
//! approximated by the slip-weighted modulation depth of the current
//! envelope over the window.

use std::collections::BTreeMap;

use super::{
    AnalyzerError, AnalyzerOutput, FaultAnalyzer, RollingWindow, SYNC_SPEED_RPM, clamp_severity,
    mean_current, validate_finite,
};
use crate::data::types::{FaultFamily, VehicleSample};

pub struct BrokenBarAnalyzer;

impl BrokenBarAnalyzer {
    /// Per-unit slip; clamped to [0, 1] (over-synchronous operation carries
    /// no rotor-bar signature)
    fn slip(sample: &VehicleSample) -> f64 {
        ((SYNC_SPEED_RPM - sample.speed) / SYNC_SPEED_RPM).clamp(0.0, 1.0)
    }
}

impl FaultAnalyzer for BrokenBarAnalyzer {
    fn family(&self) -> FaultFamily {
        FaultFamily::BrokenBar
    }

    fn analyze(
        &self,
        sample: &VehicleSample,
        window: &RollingWindow,
    ) -> Result<AnalyzerOutput, AnalyzerError> {
        validate_finite(sample)?;

        let slip = Self::slip(sample);
        let envelope_mean = window.mean_of(mean_current).abs().max(f64::EPSILON);
        let modulation_depth = if window.len() < 2 {
            0.0
        } else {
            window.std_of(mean_current) / envelope_mean
        };
        // Modulation only counts as a bar signature when slip is present
        let sideband_ratio = modulation_depth * (slip / 0.05).min(1.0);

        let severity = clamp_severity(8.0 * sideband_ratio);

        let mut features = BTreeMap::new();
        features.insert("slip".into(), slip);
        features.insert("modulation_depth".into(), modulation_depth);
        features.insert("sideband_amplitude_ratio".into(), sideband_ratio);

        Ok(AnalyzerOutput { severity, features })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn test_slip_clamps_over_synchronous_operation() {
        let mut sample = healthy_sample(1_700_000_000);
        sample.speed = 1550.0;
        assert_eq!(BrokenBarAnalyzer::slip(&sample), 0.0);
    }

    #[test]
    fn test_slip_modulated_envelope_raises_severity() {
        let mut window = RollingWindow::default();
        for i in 0..30 {
            let mut sample = healthy_sample(1_700_000_000 + i);
            sample.speed = 1380.0; // High slip
            // Envelope oscillation at (proxy) twice slip frequency
            let swing = if (i / 3) % 2 == 0 { 1.5 } else { -1.5 };
            sample.currents = [10.0 + swing, 10.0 + swing, 10.0 + swing];
            window.push(sample);
        }
        let mut sample = healthy_sample(1_700_000_100);
        sample.speed = 1380.0;

        let output = BrokenBarAnalyzer.analyze(&sample, &window).unwrap();
        assert!(output.features["sideband_amplitude_ratio"] > 0.1);
        assert!(output.severity > 0.5);
    }

    #[test]
    fn test_steady_envelope_scores_low_even_at_high_slip() {
        let mut window = RollingWindow::default();
        for i in 0..30 {
            let mut sample = healthy_sample(1_700_000_000 + i);
            sample.speed = 1380.0;
            window.push(sample);
        }
        let mut sample = healthy_sample(1_700_000_100);
        sample.speed = 1380.0;

        let output = BrokenBarAnalyzer.analyze(&sample, &window).unwrap();
        assert!(output.severity < 0.1);
    }
}
