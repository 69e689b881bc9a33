//! Air-gap eccentricity analyzer
//!
//! Static eccentricity (displaced but fixed rotor axis) produces a
//! persistent phase unbalance; dynamic eccentricity (whirling axis)
//! modulates the unbalance at rotation frequency. The window statistics of
//! the unbalance signal separate the two.

use std::collections::BTreeMap;

use super::{
    AnalyzerError, AnalyzerOutput, FaultAnalyzer, RollingWindow, clamp_severity, phase_unbalance,
    validate_finite,
};
use crate::data::types::{FaultFamily, VehicleSample};

pub struct EccentricityAnalyzer;

impl FaultAnalyzer for EccentricityAnalyzer {
    fn family(&self) -> FaultFamily {
        FaultFamily::Eccentricity
    }

    fn analyze(
        &self,
        sample: &VehicleSample,
        window: &RollingWindow,
    ) -> Result<AnalyzerOutput, AnalyzerError> {
        validate_finite(sample)?;

        let static_index = if window.is_empty() {
            phase_unbalance(sample)
        } else {
            window.mean_of(phase_unbalance)
        };
        let dynamic_index = window.std_of(phase_unbalance);

        let severity = clamp_severity(2.0 * static_index + 10.0 * dynamic_index);

        let mut features = BTreeMap::new();
        features.insert("static_eccentricity_index".into(), static_index);
        features.insert("dynamic_eccentricity_index".into(), dynamic_index);

        Ok(AnalyzerOutput { severity, features })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn test_persistent_unbalance_raises_static_index() {
        let mut window = RollingWindow::default();
        for i in 0..20 {
            let mut sample = healthy_sample(1_700_000_000 + i);
            sample.currents = [12.0, 9.0, 9.0];
            window.push(sample);
        }
        let mut sample = healthy_sample(1_700_000_100);
        sample.currents = [12.0, 9.0, 9.0];

        let output = EccentricityAnalyzer.analyze(&sample, &window).unwrap();
        assert!(output.features["static_eccentricity_index"] > 0.15);
        assert!(output.severity > 0.3);
    }

    #[test]
    fn test_modulated_unbalance_raises_dynamic_index() {
        let mut window = RollingWindow::default();
        for i in 0..20 {
            let mut sample = healthy_sample(1_700_000_000 + i);
            // Unbalance alternates: whirling rotor signature
            if i % 2 == 0 {
                sample.currents = [11.0, 9.5, 9.5];
            }
            window.push(sample);
        }
        let sample = healthy_sample(1_700_000_100);

        let output = EccentricityAnalyzer.analyze(&sample, &window).unwrap();
        assert!(
            output.features["dynamic_eccentricity_index"]
                > output.features["static_eccentricity_index"] / 10.0
        );
        assert!(output.severity > 0.2);
    }
}
