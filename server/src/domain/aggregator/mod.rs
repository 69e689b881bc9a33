//! Result aggregator
//!
//! Joins per-family fault scores into a rolling per-vehicle health
//! assessment. Consumes the results stream with its own group, keeps the
//! per-family slots fresh, and publishes a new assessment when the composite
//! moves past the hysteresis delta or the status class transitions.
//!
//! The aggregator is the single writer of its vehicle map; the API reads
//! copy-on-read snapshots for the health and alerts endpoints.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::constants::{
    AGGREGATION_HYSTERESIS, AGGREGATION_INTERVAL_MS, AGGREGATOR_FRESHNESS_SECS, CLAIM_INTERVAL_SECS,
    CLAIM_MAX_COUNT, CLAIM_MIN_IDLE_MS, CRITICAL_RING_CAP, GROUP_AGGREGATION, READ_BLOCK_MS,
    STREAM_HEALTH, STREAM_RESULTS,
};
use crate::data::broker::{BrokerService, Delivery, GroupStart};
use crate::data::types::{AlertLevel, FaultFamily, FaultScore, HealthAssessment};
use crate::utils::time::now_ms;

/// Composite-score jump that escalates the alert level one step
const RATE_OF_CHANGE_ESCALATION: f64 = 0.2;

/// Tuning knobs; tests shrink the windows
#[derive(Debug, Clone)]
pub struct AggregatorOptions {
    pub freshness: chrono::Duration,
    pub publish_interval_ms: i64,
    pub hysteresis: f64,
    pub read_block_ms: u64,
    pub claim_interval: Duration,
    pub claim_min_idle_ms: u64,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self {
            freshness: chrono::Duration::seconds(AGGREGATOR_FRESHNESS_SECS),
            publish_interval_ms: AGGREGATION_INTERVAL_MS,
            hysteresis: AGGREGATION_HYSTERESIS,
            read_block_ms: READ_BLOCK_MS,
            claim_interval: Duration::from_secs(CLAIM_INTERVAL_SECS),
            claim_min_idle_ms: CLAIM_MIN_IDLE_MS,
        }
    }
}

// ============================================================================
// PURE COMPOSITION
// ============================================================================

/// Per-vehicle aggregation slot
#[derive(Debug, Default, Clone)]
struct VehicleSlot {
    scores: BTreeMap<FaultFamily, FaultScore>,
    last_published: Option<HealthAssessment>,
    last_published_at_ms: i64,
}

impl VehicleSlot {
    /// Fold a score into the slot. The per-family entry is monotone in
    /// `sample_timestamp`, which makes duplicate delivery a no-op.
    fn update(&mut self, score: FaultScore, freshness: chrono::Duration) {
        let newer = self
            .scores
            .get(&score.family)
            .is_none_or(|existing| score.sample_timestamp >= existing.sample_timestamp);
        if newer {
            self.scores.insert(score.family, score);
        }

        // Prune stale families relative to the newest sample seen
        if let Some(newest) = self.scores.values().map(|s| s.sample_timestamp).max() {
            let cutoff = newest - freshness;
            self.scores.retain(|_, s| s.sample_timestamp >= cutoff);
        }
    }

    /// Compose the current assessment; `None` when no fresh scores remain
    fn compose(&self, vehicle_id: &str, assessed_at: DateTime<Utc>) -> Option<HealthAssessment> {
        if self.scores.is_empty() {
            return None;
        }
        let composite_score = self
            .scores
            .values()
            .map(|s| s.severity)
            .fold(0.0_f64, f64::max);
        let overall_status = self
            .scores
            .values()
            .map(|s| s.status)
            .max()
            .unwrap_or_default();

        let prior = self.last_published.as_ref().map(|a| a.composite_score);
        let alert_level = alert_level_for(composite_score, prior);

        Some(HealthAssessment {
            vehicle_id: vehicle_id.to_string(),
            assessed_at,
            per_family_scores: self.scores.clone(),
            composite_score,
            overall_status,
            alert_level,
        })
    }

    /// Publish when the status class transitions (always) or the composite
    /// moved past the hysteresis delta outside the per-vehicle throttle.
    fn should_publish(&self, candidate: &HealthAssessment, now_ms: i64, options: &AggregatorOptions) -> bool {
        let Some(prev) = &self.last_published else {
            return true;
        };
        if candidate.overall_status != prev.overall_status {
            return true;
        }
        if (candidate.composite_score - prev.composite_score).abs() <= options.hysteresis {
            return false;
        }
        now_ms - self.last_published_at_ms >= options.publish_interval_ms
    }
}

/// Threshold the composite, then escalate one step on a fast rise
fn alert_level_for(composite: f64, prior_composite: Option<f64>) -> AlertLevel {
    let base = if composite >= 0.8 {
        AlertLevel::Critical
    } else if composite >= 0.5 {
        AlertLevel::Warning
    } else if composite >= 0.25 {
        AlertLevel::Info
    } else {
        AlertLevel::None
    };

    let rising_fast = prior_composite
        .is_some_and(|prior| composite - prior > RATE_OF_CHANGE_ESCALATION);
    if rising_fast {
        match base {
            AlertLevel::None => AlertLevel::Info,
            AlertLevel::Info => AlertLevel::Warning,
            AlertLevel::Warning | AlertLevel::Critical => AlertLevel::Critical,
        }
    } else {
        base
    }
}

// ============================================================================
// SHARED SNAPSHOT STATE
// ============================================================================

/// Single-writer state shared with the API handlers
#[derive(Default)]
pub struct AggregatorState {
    latest: RwLock<HashMap<String, HealthAssessment>>,
    critical: RwLock<VecDeque<HealthAssessment>>,
    pub assessed: AtomicU64,
    pub dead_lettered: AtomicU64,
}

impl AggregatorState {
    /// Latest assessment for a vehicle (copy-on-read)
    pub fn latest_for(&self, vehicle_id: &str) -> Option<HealthAssessment> {
        self.latest.read().get(vehicle_id).cloned()
    }

    /// Most recent critical assessments, newest first
    pub fn recent_critical(&self, limit: usize) -> Vec<HealthAssessment> {
        self.critical.read().iter().rev().take(limit).cloned().collect()
    }

    pub fn vehicle_count(&self) -> usize {
        self.latest.read().len()
    }

    fn record(&self, assessment: &HealthAssessment) {
        self.latest
            .write()
            .insert(assessment.vehicle_id.clone(), assessment.clone());
        if assessment.alert_level == AlertLevel::Critical {
            let mut ring = self.critical.write();
            ring.push_back(assessment.clone());
            while ring.len() > CRITICAL_RING_CAP {
                ring.pop_front();
            }
        }
        self.assessed.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// AGGREGATOR TASK
// ============================================================================

pub struct HealthAggregator {
    broker: BrokerService,
    options: AggregatorOptions,
    state: Arc<AggregatorState>,
    slots: HashMap<String, VehicleSlot>,
}

impl HealthAggregator {
    pub fn new(broker: BrokerService, options: AggregatorOptions) -> Self {
        Self {
            broker,
            options,
            state: Arc::new(AggregatorState::default()),
            slots: HashMap::new(),
        }
    }

    /// Snapshot handle for the API layer
    pub fn state(&self) -> Arc<AggregatorState> {
        Arc::clone(&self.state)
    }

    /// Spawn the aggregation loop; resolves ready once subscribed
    pub async fn start(
        mut self,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, crate::data::broker::BrokerError> {
        let consumer = format!("aggregator:{}", Uuid::new_v4());
        let reader = self
            .broker
            .stream::<FaultScore>(STREAM_RESULTS)
            .reader(GROUP_AGGREGATION, &consumer, GroupStart::Earliest)
            .await?;
        let health = self.broker.stream::<HealthAssessment>(STREAM_HEALTH);

        tracing::debug!(consumer = %consumer, "Result aggregator started");

        Ok(tokio::spawn(async move {
            let mut claim_interval = tokio::time::interval(self.options.claim_interval);
            claim_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }

                    _ = claim_interval.tick() => {
                        match reader.claim_stale(self.options.claim_min_idle_ms, CLAIM_MAX_COUNT).await {
                            Ok(claimed) => {
                                for delivery in claimed {
                                    self.handle(&reader, &health, delivery).await;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Aggregator claim scan failed");
                            }
                        }
                    }

                    batch = reader.read(32, self.options.read_block_ms) => {
                        match batch {
                            Ok(batch) => {
                                for delivery in batch {
                                    self.handle(&reader, &health, delivery).await;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Aggregator read failed, backing off");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
            }

            tracing::debug!("Result aggregator stopped");
        }))
    }

    async fn handle(
        &mut self,
        reader: &crate::data::broker::GroupReader<FaultScore>,
        health: &crate::data::broker::JsonStream<HealthAssessment>,
        delivery: Delivery<FaultScore>,
    ) {
        let score = match delivery.payload {
            Ok(score) => score,
            Err(e) => {
                tracing::warn!(msg_id = %delivery.id, error = %e, "Malformed fault score, discarding");
                self.state.dead_lettered.fetch_add(1, Ordering::Relaxed);
                let _ = reader.ack_one(&delivery.id).await;
                return;
            }
        };

        let vehicle_id = score.vehicle_id.clone();
        let slot = self.slots.entry(vehicle_id.clone()).or_default();
        slot.update(score, self.options.freshness);

        let assessed_at = Utc::now();
        let now = now_ms();
        if let Some(assessment) = slot.compose(&vehicle_id, assessed_at)
            && slot.should_publish(&assessment, now, &self.options)
        {
            match health
                .publish(Some(&vehicle_id), Some("health_assessment"), &assessment)
                .await
            {
                Ok(_) => {
                    self.state.record(&assessment);
                    slot.last_published = Some(assessment);
                    slot.last_published_at_ms = now;
                }
                Err(e) => {
                    // Leave unacked so the score is claimed and re-folded;
                    // the slot update is idempotent.
                    tracing::warn!(vehicle = %vehicle_id, error = %e, "Health publish failed");
                    return;
                }
            }
        }

        if let Err(e) = reader.ack_one(&delivery.id).await {
            tracing::warn!(msg_id = %delivery.id, error = %e, "Failed to ack fault score");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::FaultStatus;
    use chrono::TimeZone;

    fn score(
        family: FaultFamily,
        severity: f64,
        status: FaultStatus,
        ts_secs: i64,
    ) -> FaultScore {
        FaultScore {
            vehicle_id: "V1".into(),
            sample_timestamp: Utc.timestamp_opt(ts_secs, 0).unwrap(),
            family,
            severity,
            status,
            features: BTreeMap::new(),
            produced_by: "test".into(),
            processing_latency_ms: 1,
        }
    }

    fn options() -> AggregatorOptions {
        AggregatorOptions {
            freshness: chrono::Duration::seconds(120),
            publish_interval_ms: 200,
            hysteresis: 0.05,
            read_block_ms: 20,
            claim_interval: Duration::from_millis(100),
            claim_min_idle_ms: 0,
        }
    }

    #[test]
    fn test_composite_is_worst_case_across_families() {
        let mut slot = VehicleSlot::default();
        let freshness = chrono::Duration::seconds(120);
        slot.update(score(FaultFamily::Bearing, 0.2, FaultStatus::Normal, 100), freshness);
        slot.update(score(FaultFamily::TurnFault, 0.7, FaultStatus::Fault, 101), freshness);
        slot.update(score(FaultFamily::Insulation, 0.4, FaultStatus::Warning, 102), freshness);

        let assessment = slot.compose("V1", Utc::now()).unwrap();
        assert_eq!(assessment.composite_score, 0.7);
        assert_eq!(assessment.overall_status, FaultStatus::Fault);
        assert_eq!(assessment.per_family_scores.len(), 3);
    }

    #[test]
    fn test_per_family_slot_is_monotone() {
        let mut slot = VehicleSlot::default();
        let freshness = chrono::Duration::seconds(120);
        slot.update(score(FaultFamily::Bearing, 0.6, FaultStatus::Fault, 200), freshness);
        // A late-arriving older score must not regress the slot
        slot.update(score(FaultFamily::Bearing, 0.1, FaultStatus::Normal, 150), freshness);

        let assessment = slot.compose("V1", Utc::now()).unwrap();
        assert_eq!(assessment.composite_score, 0.6);
    }

    #[test]
    fn test_duplicate_scores_leave_assessment_unchanged() {
        let mut slot = VehicleSlot::default();
        let freshness = chrono::Duration::seconds(120);
        let s = score(FaultFamily::Bearing, 0.3, FaultStatus::Warning, 100);
        slot.update(s.clone(), freshness);
        let first = slot.compose("V1", Utc.timestamp_opt(0, 0).unwrap()).unwrap();
        slot.update(s, freshness);
        let second = slot.compose("V1", Utc.timestamp_opt(0, 0).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_stale_families_are_pruned() {
        let mut slot = VehicleSlot::default();
        let freshness = chrono::Duration::seconds(120);
        slot.update(score(FaultFamily::Bearing, 0.9, FaultStatus::Fault, 100), freshness);
        // 10 minutes later only the fresh family remains
        slot.update(score(FaultFamily::Insulation, 0.1, FaultStatus::Normal, 700), freshness);

        let assessment = slot.compose("V1", Utc::now()).unwrap();
        assert_eq!(assessment.per_family_scores.len(), 1);
        assert!(assessment.per_family_scores.contains_key(&FaultFamily::Insulation));
        assert_eq!(assessment.composite_score, 0.1);
    }

    #[test]
    fn test_hysteresis_suppresses_small_moves() {
        let opts = options();
        let mut slot = VehicleSlot::default();
        slot.update(score(FaultFamily::Bearing, 0.30, FaultStatus::Warning, 100), opts.freshness);
        let first = slot.compose("V1", Utc::now()).unwrap();
        assert!(slot.should_publish(&first, 0, &opts));
        slot.last_published = Some(first);
        slot.last_published_at_ms = 0;

        // Tiny severity move, same status: suppressed
        slot.update(score(FaultFamily::Bearing, 0.33, FaultStatus::Warning, 101), opts.freshness);
        let second = slot.compose("V1", Utc::now()).unwrap();
        assert!(!slot.should_publish(&second, 1_000, &opts));

        // Status transition always publishes, even inside the throttle window
        slot.update(score(FaultFamily::Bearing, 0.65, FaultStatus::Fault, 102), opts.freshness);
        let third = slot.compose("V1", Utc::now()).unwrap();
        assert!(slot.should_publish(&third, 1, &opts));
    }

    #[test]
    fn test_throttle_defers_severity_only_moves() {
        let opts = options();
        let mut slot = VehicleSlot::default();
        slot.update(score(FaultFamily::Bearing, 0.30, FaultStatus::Warning, 100), opts.freshness);
        let first = slot.compose("V1", Utc::now()).unwrap();
        slot.last_published = Some(first);
        slot.last_published_at_ms = 1_000;

        // Large move but same status, inside the 200ms interval: deferred
        slot.update(score(FaultFamily::Bearing, 0.45, FaultStatus::Warning, 101), opts.freshness);
        let candidate = slot.compose("V1", Utc::now()).unwrap();
        assert!(!slot.should_publish(&candidate, 1_100, &opts));
        // Outside the interval it goes through
        assert!(slot.should_publish(&candidate, 1_300, &opts));
    }

    #[test]
    fn test_alert_level_thresholds_and_escalation() {
        assert_eq!(alert_level_for(0.1, None), AlertLevel::None);
        assert_eq!(alert_level_for(0.3, None), AlertLevel::Info);
        assert_eq!(alert_level_for(0.6, None), AlertLevel::Warning);
        assert_eq!(alert_level_for(0.9, None), AlertLevel::Critical);
        // A fast rise escalates one level
        assert_eq!(alert_level_for(0.6, Some(0.1)), AlertLevel::Critical);
        assert_eq!(alert_level_for(0.3, Some(0.05)), AlertLevel::Warning);
        // Slow drift does not
        assert_eq!(alert_level_for(0.6, Some(0.55)), AlertLevel::Warning);
    }

    #[tokio::test]
    async fn test_aggregator_publishes_assessments_end_to_end() {
        let broker = BrokerService::memory();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let aggregator = HealthAggregator::new(broker.clone(), options());
        let state = aggregator.state();
        let handle = aggregator.start(shutdown_rx).await.unwrap();

        let results = broker.stream::<FaultScore>(STREAM_RESULTS);
        results
            .publish(
                Some("V1"),
                Some("fault_score"),
                &score(FaultFamily::Bearing, 0.9, FaultStatus::Fault, 1_700_000_000),
            )
            .await
            .unwrap();

        let health_reader = broker
            .stream::<HealthAssessment>(STREAM_HEALTH)
            .reader("test_health", "r", GroupStart::Earliest)
            .await
            .unwrap();

        let mut published = None;
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while published.is_none() && std::time::Instant::now() < deadline {
            published = health_reader.read(1, 100).await.unwrap().into_iter().next();
        }
        let assessment = published.unwrap().payload.unwrap();
        assert_eq!(assessment.vehicle_id, "V1");
        assert_eq!(assessment.overall_status, FaultStatus::Fault);
        assert_eq!(assessment.alert_level, AlertLevel::Critical);

        // Snapshot state serves the API
        assert!(state.latest_for("V1").is_some());
        assert_eq!(state.recent_critical(10).len(), 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
