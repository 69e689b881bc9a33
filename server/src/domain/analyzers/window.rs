//! Per-vehicle rolling sample window
//!
//! Bounded recent-sample buffer the worker maintains for each vehicle it has
//! seen. Eviction is by capacity and by sample age relative to the newest
//! sample, so behavior is deterministic under replay.

use std::collections::VecDeque;

use chrono::Duration;

use crate::core::constants::{ROLLING_WINDOW_CAP, ROLLING_WINDOW_MAX_AGE_SECS};
use crate::data::types::VehicleSample;

/// Bounded window of recent samples for one vehicle
#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: VecDeque<VehicleSample>,
    cap: usize,
    max_age: Duration,
}

impl Default for RollingWindow {
    fn default() -> Self {
        Self::new(ROLLING_WINDOW_CAP, ROLLING_WINDOW_MAX_AGE_SECS)
    }
}

impl RollingWindow {
    pub fn new(cap: usize, max_age_secs: i64) -> Self {
        Self {
            samples: VecDeque::with_capacity(cap),
            cap,
            max_age: Duration::seconds(max_age_secs),
        }
    }

    /// Append a sample, evicting by capacity and by age
    pub fn push(&mut self, sample: VehicleSample) {
        self.samples.push_back(sample);
        while self.samples.len() > self.cap {
            self.samples.pop_front();
        }
        if let Some(newest) = self.samples.back().map(|s| s.timestamp) {
            let cutoff = newest - self.max_age;
            while let Some(front) = self.samples.front()
                && front.timestamp < cutoff
            {
                self.samples.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&VehicleSample> {
        self.samples.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VehicleSample> {
        self.samples.iter()
    }

    /// Mean of a per-sample scalar over the window
    pub fn mean_of(&self, f: impl Fn(&VehicleSample) -> f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(&f).sum::<f64>() / self.samples.len() as f64
    }

    /// Population standard deviation of a per-sample scalar
    pub fn std_of(&self, f: impl Fn(&VehicleSample) -> f64) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let mean = self.mean_of(&f);
        let var = self
            .samples
            .iter()
            .map(|s| {
                let d = f(s) - mean;
                d * d
            })
            .sum::<f64>()
            / self.samples.len() as f64;
        var.sqrt()
    }

    /// Excess kurtosis of a per-sample scalar (0 for a normal distribution).
    /// Returns 0 when the window is too short or the signal is flat.
    pub fn kurtosis_of(&self, f: impl Fn(&VehicleSample) -> f64) -> f64 {
        if self.samples.len() < 4 {
            return 0.0;
        }
        let mean = self.mean_of(&f);
        let n = self.samples.len() as f64;
        let m2 = self.samples.iter().map(|s| (f(s) - mean).powi(2)).sum::<f64>() / n;
        if m2 <= f64::EPSILON {
            return 0.0;
        }
        let m4 = self.samples.iter().map(|s| (f(s) - mean).powi(4)).sum::<f64>() / n;
        m4 / (m2 * m2) - 3.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample_at(secs: i64, current: f64) -> VehicleSample {
        VehicleSample {
            vehicle_id: "V1".into(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            currents: [current, current, current],
            voltage: 380.0,
            speed: 1480.0,
            torque: 45.0,
            temperature: 60.0,
            location: None,
            metadata: None,
        }
    }

    #[test]
    fn test_capacity_eviction() {
        let mut window = RollingWindow::new(3, 3600);
        for i in 0..5 {
            window.push(sample_at(1_700_000_000 + i, 10.0));
        }
        assert_eq!(window.len(), 3);
        assert_eq!(
            window.latest().unwrap().timestamp.timestamp(),
            1_700_000_004
        );
    }

    #[test]
    fn test_age_eviction_is_relative_to_newest() {
        let mut window = RollingWindow::new(100, 60);
        window.push(sample_at(1_700_000_000, 10.0));
        window.push(sample_at(1_700_000_030, 10.0));
        // Third sample two minutes later pushes the first two past the window
        window.push(sample_at(1_700_000_120, 10.0));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_statistics() {
        let mut window = RollingWindow::new(100, 3600);
        for (i, value) in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0].iter().enumerate() {
            window.push(sample_at(1_700_000_000 + i as i64, *value));
        }
        let mean = window.mean_of(|s| s.currents[0]);
        let std = window.std_of(|s| s.currents[0]);
        assert!((mean - 5.0).abs() < 1e-9);
        assert!((std - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_kurtosis_of_flat_signal_is_zero() {
        let mut window = RollingWindow::new(100, 3600);
        for i in 0..10 {
            window.push(sample_at(1_700_000_000 + i, 10.0));
        }
        assert_eq!(window.kurtosis_of(|s| s.currents[0]), 0.0);
    }
}
