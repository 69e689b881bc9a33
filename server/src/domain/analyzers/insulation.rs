//! Winding insulation analyzer
//!
//! Insulation degradation is thermal: sustained operation above the
//! reference winding temperature roughly halves insulation life per 10 °C.
//! The analyzer tracks the temperature ratio, the residual against the
//! load-expected temperature, and an aging accumulator over the window.

use std::collections::BTreeMap;

use super::{
    AnalyzerError, AnalyzerOutput, FaultAnalyzer, REFERENCE_WINDING_TEMP, RollingWindow,
    clamp_severity, efficiency_residual, validate_finite,
};
use crate::data::types::{FaultFamily, VehicleSample};

pub struct InsulationAnalyzer;

impl InsulationAnalyzer {
    /// Expected winding temperature under the sample's load point
    fn expected_temperature(sample: &VehicleSample) -> f64 {
        40.0 + 0.3 * sample.torque + 0.01 * sample.speed
    }

    /// Per-sample insulation aging factor (1.0 at the reference temperature)
    fn aging_factor(sample: &VehicleSample) -> f64 {
        2.0_f64.powf((sample.temperature - REFERENCE_WINDING_TEMP) / 10.0)
    }
}

impl FaultAnalyzer for InsulationAnalyzer {
    fn family(&self) -> FaultFamily {
        FaultFamily::Insulation
    }

    fn analyze(
        &self,
        sample: &VehicleSample,
        window: &RollingWindow,
    ) -> Result<AnalyzerOutput, AnalyzerError> {
        validate_finite(sample)?;

        let temp_ratio = sample.temperature / REFERENCE_WINDING_TEMP;
        let thermal_residual = (sample.temperature - Self::expected_temperature(sample)).max(0.0);
        let aging = if window.is_empty() {
            Self::aging_factor(sample)
        } else {
            window.mean_of(Self::aging_factor)
        };
        let eff_trend = window.mean_of(efficiency_residual);

        let severity = clamp_severity(
            0.6 * ((temp_ratio - 0.8) / 0.5).clamp(0.0, 1.0)
                + 0.3 * (thermal_residual / 50.0).min(1.0)
                + 0.1 * eff_trend,
        );

        let mut features = BTreeMap::new();
        features.insert("winding_temp_ratio".into(), temp_ratio);
        features.insert("thermal_residual".into(), thermal_residual);
        features.insert("thermal_aging_accumulator".into(), aging);
        features.insert("efficiency_residual_trend".into(), eff_trend);

        Ok(AnalyzerOutput { severity, features })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::Thresholds;
    use super::*;
    use crate::data::types::FaultStatus;

    #[test]
    fn test_moderate_overtemperature_is_warning() {
        let window = healthy_window(20);
        let mut sample = healthy_sample(1_700_000_100);
        sample.temperature = 96.0;

        let output = InsulationAnalyzer.analyze(&sample, &window).unwrap();
        let status = Thresholds::for_family(FaultFamily::Insulation).band(output.severity);
        assert_eq!(status, FaultStatus::Warning);
    }

    #[test]
    fn test_severe_overtemperature_is_fault() {
        let window = healthy_window(20);
        let mut sample = healthy_sample(1_700_000_100);
        sample.temperature = 135.0;

        let output = InsulationAnalyzer.analyze(&sample, &window).unwrap();
        let status = Thresholds::for_family(FaultFamily::Insulation).band(output.severity);
        assert_eq!(status, FaultStatus::Fault);
        assert!(output.features["thermal_aging_accumulator"] > 0.0);
    }
}
