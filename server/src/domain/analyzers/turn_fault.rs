//! Stator turn-fault analyzer
//!
//! Inter-turn short circuits break the symmetry of the stator winding, which
//! shows up as negative-sequence current and phase unbalance long before the
//! machine trips. The q-axis residual kurtosis catches the intermittent
//! arcing phase of an early fault.

use std::collections::BTreeMap;

use super::{
    AnalyzerError, AnalyzerOutput, FaultAnalyzer, RollingWindow, clamp_severity,
    efficiency_residual, mean_current, phase_unbalance, validate_finite,
};
use crate::data::types::{FaultFamily, VehicleSample};

pub struct TurnFaultAnalyzer;

impl TurnFaultAnalyzer {
    /// Negative-sequence ratio approximation from phase magnitudes
    fn negative_sequence_ratio(sample: &VehicleSample) -> f64 {
        let mean = mean_current(sample);
        let variance = sample
            .currents
            .iter()
            .map(|c| {
                let d = c - mean;
                d * d
            })
            .sum::<f64>()
            / 3.0;
        variance.sqrt() / mean.abs()
    }
}

impl FaultAnalyzer for TurnFaultAnalyzer {
    fn family(&self) -> FaultFamily {
        FaultFamily::TurnFault
    }

    fn analyze(
        &self,
        sample: &VehicleSample,
        window: &RollingWindow,
    ) -> Result<AnalyzerOutput, AnalyzerError> {
        validate_finite(sample)?;

        // The symmetric-component decomposition is undefined without
        // excitation; such a sample can never produce a valid score.
        if mean_current(sample).abs() < f64::EPSILON {
            return Err(AnalyzerError::Poison(
                "zero phase currents, negative-sequence ratio undefined".into(),
            ));
        }

        let negative_seq = Self::negative_sequence_ratio(sample);
        let unbalance = phase_unbalance(sample);
        let q_axis_kurtosis = window.kurtosis_of(phase_unbalance);
        let eff_residual = efficiency_residual(sample);

        let severity = clamp_severity(
            4.0 * negative_seq
                + 2.0 * unbalance
                + 0.5 * eff_residual
                + 0.05 * q_axis_kurtosis.max(0.0),
        );

        let mut features = BTreeMap::new();
        features.insert("negative_sequence_ratio".into(), negative_seq);
        features.insert("phase_unbalance".into(), unbalance);
        features.insert("q_axis_residual_kurtosis".into(), q_axis_kurtosis);
        features.insert("efficiency_residual".into(), eff_residual);

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
    fn test_unbalanced_phases_raise_severity() {
        let window = healthy_window(20);
        let mut sample = healthy_sample(1_700_000_100);
        sample.currents = [10.0, 7.0, 12.3];

        let output = TurnFaultAnalyzer.analyze(&sample, &window).unwrap();
        let status = Thresholds::for_family(FaultFamily::TurnFault).band(output.severity);
        assert_eq!(status, FaultStatus::Fault);
        assert!(output.features["negative_sequence_ratio"] > 0.1);
    }

    #[test]
    fn test_zero_currents_are_poison() {
        let window = healthy_window(5);
        let mut sample = healthy_sample(1_700_000_100);
        sample.currents = [0.0, 0.0, 0.0];

        let err = TurnFaultAnalyzer.analyze(&sample, &window).unwrap_err();
        assert!(err.is_poison());
    }
}
