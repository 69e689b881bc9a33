//! Per-family autoscaler
//!
//! Pure decision state machine: the coordinator feeds it backlog and
//! utilization observations, it answers with scale decisions. Hysteresis
//! comes from the threshold gap (up at least 2x down), the sustain windows,
//! and the per-family cooldown.

use crate::core::constants::{
    MAX_CONSUMERS_PER_FAMILY, MIN_CONSUMERS_PER_FAMILY, SCALE_COOLDOWN_SECS, SCALE_DOWN_BACKLOG,
    SCALE_IDLE_UTILIZATION, SCALE_SUSTAIN_DOWN_SECS, SCALE_SUSTAIN_UP_SECS, SCALE_UP_BACKLOG,
};
use crate::data::types::FaultFamily;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Add one consumer
    Up,
    /// Drain and remove one consumer
    Down,
}

/// Scaler tuning; tests shrink the windows
#[derive(Debug, Clone)]
pub struct ScalerOptions {
    pub up_threshold: u64,
    pub down_threshold: u64,
    pub sustain_up_ms: i64,
    pub sustain_down_ms: i64,
    pub cooldown_ms: i64,
    pub idle_utilization: f64,
    pub min_consumers: usize,
    pub max_consumers: usize,
}

impl Default for ScalerOptions {
    fn default() -> Self {
        Self {
            up_threshold: SCALE_UP_BACKLOG,
            down_threshold: SCALE_DOWN_BACKLOG,
            sustain_up_ms: (SCALE_SUSTAIN_UP_SECS * 1000) as i64,
            sustain_down_ms: (SCALE_SUSTAIN_DOWN_SECS * 1000) as i64,
            cooldown_ms: (SCALE_COOLDOWN_SECS * 1000) as i64,
            idle_utilization: SCALE_IDLE_UTILIZATION,
            min_consumers: MIN_CONSUMERS_PER_FAMILY,
            max_consumers: MAX_CONSUMERS_PER_FAMILY,
        }
    }
}

/// Decision state for one family
#[derive(Debug)]
pub struct FamilyScaler {
    family: FaultFamily,
    options: ScalerOptions,
    /// Since when the backlog has been above the up threshold
    pressured_since: Option<i64>,
    /// Since when the pool has been idle below the down threshold
    idle_since: Option<i64>,
    last_decision_ms: Option<i64>,
}

impl FamilyScaler {
    pub fn new(family: FaultFamily, options: ScalerOptions) -> Self {
        Self {
            family,
            options,
            pressured_since: None,
            idle_since: None,
            last_decision_ms: None,
        }
    }

    pub fn family(&self) -> FaultFamily {
        self.family
    }

    /// Feed one observation; returns a decision when one is due.
    ///
    /// `backlog` is the group's pending depth, `avg_utilization` in [0, 1]
    /// across the family's live workers.
    pub fn observe(
        &mut self,
        now_ms: i64,
        backlog: u64,
        pool_size: usize,
        avg_utilization: f64,
    ) -> Option<ScaleDecision> {
        // Threshold comparisons are strict: sitting exactly at a threshold
        // does not arm either timer.
        if backlog > self.options.up_threshold {
            self.pressured_since.get_or_insert(now_ms);
            self.idle_since = None;
        } else if backlog < self.options.down_threshold
            && avg_utilization < self.options.idle_utilization
        {
            self.idle_since.get_or_insert(now_ms);
            self.pressured_since = None;
        } else {
            self.pressured_since = None;
            self.idle_since = None;
        }

        if let Some(last) = self.last_decision_ms
            && now_ms - last < self.options.cooldown_ms
        {
            return None;
        }

        if let Some(since) = self.pressured_since
            && now_ms - since >= self.options.sustain_up_ms
            && pool_size < self.options.max_consumers
        {
            self.last_decision_ms = Some(now_ms);
            self.pressured_since = None;
            return Some(ScaleDecision::Up);
        }

        if let Some(since) = self.idle_since
            && now_ms - since >= self.options.sustain_down_ms
            && pool_size > self.options.min_consumers
        {
            self.last_decision_ms = Some(now_ms);
            self.idle_since = None;
            return Some(ScaleDecision::Down);
        }

        None
    }
}
