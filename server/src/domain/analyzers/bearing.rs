//! Bearing fault analyzer
//!
//! Rolling-element defects inject periodic impulses into the drive train,
//! visible in the stator current envelope as impulsive (high-kurtosis,
//! high-crest) modulation rather than a shift of the operating point.

use std::collections::BTreeMap;

use super::{
    AnalyzerError, AnalyzerOutput, FaultAnalyzer, RollingWindow, clamp_severity, mean_current,
    validate_finite,
};
use crate::data::types::{FaultFamily, VehicleSample};

/// Crest factor of an undistorted sinusoid; excess over this is impulsive
const SINUSOID_CREST: f64 = 1.5;

pub struct BearingAnalyzer;

impl BearingAnalyzer {
    /// Crest factor of the current envelope over the window
    fn crest_factor(window: &RollingWindow) -> f64 {
        let mean = window.mean_of(mean_current);
        if mean.abs() < f64::EPSILON {
            return 0.0;
        }
        let peak = window
            .iter()
            .map(mean_current)
            .fold(0.0_f64, |acc, c| acc.max(c.abs()));
        let rms = {
            let ms = window.mean_of(|s| {
                let c = mean_current(s);
                c * c
            });
            ms.sqrt()
        };
        if rms < f64::EPSILON { 0.0 } else { peak / rms }
    }
}

impl FaultAnalyzer for BearingAnalyzer {
    fn family(&self) -> FaultFamily {
        FaultFamily::Bearing
    }

    fn analyze(
        &self,
        sample: &VehicleSample,
        window: &RollingWindow,
    ) -> Result<AnalyzerOutput, AnalyzerError> {
        validate_finite(sample)?;

        let envelope_peak = window.std_of(mean_current);
        let crest = Self::crest_factor(window);
        let kurtosis = window.kurtosis_of(mean_current);

        let crest_excess = (crest - SINUSOID_CREST).max(0.0);
        let severity = clamp_severity(
            0.5 * crest_excess.min(1.0) + 0.4 * (kurtosis.max(0.0) / 5.0).min(1.0)
                + 0.1 * (envelope_peak / mean_current(sample).abs().max(1.0)).min(1.0),
        );

        let mut features = BTreeMap::new();
        features.insert("envelope_peak".into(), envelope_peak);
        features.insert("crest_factor".into(), crest);
        features.insert("kurtosis".into(), kurtosis);

        Ok(AnalyzerOutput { severity, features })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn test_impulsive_envelope_raises_severity() {
        let mut window = healthy_window(30);
        // Inject a handful of current spikes (impulsive defect signature)
        for i in 0..4 {
            let mut spike = healthy_sample(1_700_000_100 + i);
            spike.currents = [28.0, 28.2, 27.9];
            window.push(spike);
        }
        let sample = healthy_sample(1_700_000_105);

        let flat = BearingAnalyzer
            .analyze(&sample, &healthy_window(30))
            .unwrap();
        let impulsive = BearingAnalyzer.analyze(&sample, &window).unwrap();
        assert!(impulsive.severity > flat.severity);
        assert!(impulsive.features["kurtosis"] > flat.features["kurtosis"]);
    }

    #[test]
    fn test_empty_window_scores_zero() {
        let sample = healthy_sample(1_700_000_100);
        let output = BearingAnalyzer
            .analyze(&sample, &RollingWindow::default())
            .unwrap();
        assert_eq!(output.severity, 0.0);
    }
}
