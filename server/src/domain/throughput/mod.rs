//! Throughput estimator
//!
//! Computes a messages-per-second figure that does not collapse to zero
//! during brief idle periods. A freshness factor in `[min_factor, 1]`,
//! derived from the age of the most recent write through a configurable
//! decay curve, damps the windowed base rate; an optional auto-refresh task
//! publishes a sentinel to the metrics stream so quiescence cannot drag the
//! factor to its floor.
//!
//! `ThroughputConfig` is live-mutable: API handlers send mutations through a
//! serial command channel, a single writer task applies them, and queries
//! read a copy-on-read snapshot. Changes take effect on the next query.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use utoipa::ToSchema;
use validator::Validate;

use crate::core::constants::{
    AUTO_REFRESH_INTERVAL_SECS, STREAM_METRICS, STREAM_RAW, THROUGHPUT_DEFAULT_BASE_MULTIPLIER,
    THROUGHPUT_DEFAULT_MIN_FACTOR, THROUGHPUT_DEFAULT_STEEPNESS, THROUGHPUT_DEFAULT_WINDOW_MINUTES,
    THROUGHPUT_RATE_WINDOW_SECS,
};
use crate::data::broker::{BrokerError, BrokerService};
use crate::data::types::MetricsSentinel;
use crate::utils::time::now_ms;

// ============================================================================
// CONFIG
// ============================================================================

/// Freshness decay curve shape
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DecayCurve {
    Linear,
    #[default]
    Logarithmic,
    Exponential,
    Sqrt,
}

/// Live-mutable throughput estimator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate, ToSchema)]
pub struct ThroughputConfig {
    #[validate(range(min = 10, max = 180))]
    pub freshness_window_minutes: u32,
    #[validate(range(min = 0.1, max = 0.8))]
    pub min_freshness_factor: f64,
    pub decay_curve: DecayCurve,
    #[validate(range(min = 0.1, max = 2.0))]
    pub decay_steepness: f64,
    pub auto_refresh_enabled: bool,
    #[validate(range(min = 2.0, max = 15.0))]
    pub base_multiplier: f64,
}

impl Default for ThroughputConfig {
    fn default() -> Self {
        Self {
            freshness_window_minutes: THROUGHPUT_DEFAULT_WINDOW_MINUTES,
            min_freshness_factor: THROUGHPUT_DEFAULT_MIN_FACTOR,
            decay_curve: DecayCurve::default(),
            decay_steepness: THROUGHPUT_DEFAULT_STEEPNESS,
            auto_refresh_enabled: true,
            base_multiplier: THROUGHPUT_DEFAULT_BASE_MULTIPLIER,
        }
    }
}

/// Freshness factor for a write of the given age, clamped to
/// `[min_freshness_factor, 1]`
pub fn freshness_factor(config: &ThroughputConfig, age_seconds: f64) -> f64 {
    let window_seconds = config.freshness_window_minutes as f64 * 60.0;
    let age_ratio = (age_seconds / window_seconds).max(0.0);
    let steepness = config.decay_steepness;

    let raw = match config.decay_curve {
        DecayCurve::Linear => 1.0 - age_ratio * steepness,
        DecayCurve::Logarithmic => {
            1.0 - (1.0 + age_ratio * steepness).ln() / (1.0 + steepness).ln()
        }
        DecayCurve::Exponential => (-age_ratio * steepness).exp(),
        DecayCurve::Sqrt => 1.0 - age_ratio.sqrt() * steepness,
    };

    raw.clamp(config.min_freshness_factor, 1.0)
}

// ============================================================================
// SERIAL CONFIG WRITER
// ============================================================================

enum ConfigCommand {
    Set(ThroughputConfig, oneshot::Sender<()>),
    Reset(oneshot::Sender<ThroughputConfig>),
}

/// Handle to the single-writer config state. Cloneable; reads are
/// copy-on-read snapshots, writes go through the command channel.
#[derive(Clone)]
pub struct ConfigService {
    snapshot: Arc<RwLock<ThroughputConfig>>,
    tx: mpsc::Sender<ConfigCommand>,
}

impl ConfigService {
    /// Spawn the writer task
    pub fn spawn(mut shutdown_rx: watch::Receiver<bool>) -> (Self, JoinHandle<()>) {
        let snapshot = Arc::new(RwLock::new(ThroughputConfig::default()));
        let (tx, mut rx) = mpsc::channel::<ConfigCommand>(16);

        let writer_snapshot = Arc::clone(&snapshot);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }

                    command = rx.recv() => {
                        match command {
                            Some(ConfigCommand::Set(config, ack)) => {
                                tracing::info!(?config, "Throughput config updated");
                                *writer_snapshot.write() = config;
                                let _ = ack.send(());
                            }
                            Some(ConfigCommand::Reset(ack)) => {
                                let defaults = ThroughputConfig::default();
                                *writer_snapshot.write() = defaults.clone();
                                tracing::info!("Throughput config reset to defaults");
                                let _ = ack.send(defaults);
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        (Self { snapshot, tx }, handle)
    }

    /// Current config snapshot
    pub fn get(&self) -> ThroughputConfig {
        self.snapshot.read().clone()
    }

    /// Validate and apply a new config. On validation failure the current
    /// config is unchanged and the offending fields are reported.
    pub async fn set(&self, config: ThroughputConfig) -> Result<(), validator::ValidationErrors> {
        config.validate()?;
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(ConfigCommand::Set(config, ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
        Ok(())
    }

    /// Restore defaults; returns the restored config
    pub async fn reset(&self) -> ThroughputConfig {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(ConfigCommand::Reset(ack_tx)).await.is_ok()
            && let Ok(defaults) = ack_rx.await
        {
            return defaults;
        }
        ThroughputConfig::default()
    }
}

// ============================================================================
// ESTIMATOR
// ============================================================================

/// One throughput estimate, as served by `GET /system/performance`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ThroughputEstimate {
    /// Final damped estimate
    pub messages_per_second: u64,
    /// Windowed rate before damping (messages/second)
    pub base_rate: f64,
    pub freshness_factor: f64,
    pub last_write_age_seconds: f64,
    pub config: ThroughputConfig,
}

pub struct ThroughputEstimator {
    broker: BrokerService,
    config: ConfigService,
}

impl ThroughputEstimator {
    pub fn new(broker: BrokerService, config: ConfigService) -> Self {
        Self { broker, config }
    }

    pub fn config(&self) -> &ConfigService {
        &self.config
    }

    /// Compute the current estimate. The freshness age comes from the most
    /// recent write to the metrics stream, falling back to the raw stream;
    /// the base rate is counted over the raw stream's last minute.
    pub async fn estimate(&self) -> Result<ThroughputEstimate, BrokerError> {
        let config = self.config.get();
        let now = now_ms();

        let last_write_ms = match self.broker.last_entry_ms(STREAM_METRICS).await? {
            Some(ms) => Some(ms),
            None => self.broker.last_entry_ms(STREAM_RAW).await?,
        };
        let age_seconds = match last_write_ms {
            Some(ms) => ((now - ms) as f64 / 1000.0).max(0.0),
            // Nothing ever written: treat as maximally stale
            None => config.freshness_window_minutes as f64 * 60.0,
        };

        let window_count = self
            .broker
            .count_since(STREAM_RAW, now - THROUGHPUT_RATE_WINDOW_SECS * 1000)
            .await?;
        let base_rate = window_count as f64 / THROUGHPUT_RATE_WINDOW_SECS as f64;

        let factor = freshness_factor(&config, age_seconds);
        let messages_per_second = (base_rate * config.base_multiplier * factor).round() as u64;

        Ok(ThroughputEstimate {
            messages_per_second,
            base_rate,
            freshness_factor: factor,
            last_write_age_seconds: age_seconds,
            config,
        })
    }

    /// Curve preview: the factor a write of `age_minutes` would yield under
    /// the current config
    pub fn preview(&self, age_minutes: f64) -> f64 {
        freshness_factor(&self.config.get(), age_minutes * 60.0)
    }

    /// Publish a heartbeat sentinel to the metrics stream now
    pub async fn refresh(&self) -> Result<String, BrokerError> {
        let sentinel = MetricsSentinel {
            source: "throughput_refresher".into(),
            emitted_at: chrono::Utc::now(),
        };
        self.broker
            .stream::<MetricsSentinel>(STREAM_METRICS)
            .publish(None, Some("sentinel"), &sentinel)
            .await
    }

    /// Background refresher: publishes a sentinel every interval while
    /// auto-refresh is enabled and no genuine write has happened since the
    /// last tick.
    pub fn start_refresher(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::debug!(interval_secs = interval.as_secs(), "Throughput refresher started");

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }

                    _ = tick.tick() => {
                        if !self.config.get().auto_refresh_enabled {
                            continue;
                        }
                        let stale = match self.most_recent_write_ms().await {
                            Ok(Some(ms)) => now_ms() - ms >= interval.as_millis() as i64,
                            Ok(None) => true,
                            Err(e) => {
                                tracing::warn!(error = %e, "Refresher broker check failed");
                                false
                            }
                        };
                        if stale && let Err(e) = self.refresh().await {
                            tracing::warn!(error = %e, "Failed to publish refresh sentinel");
                        }
                    }
                }
            }
            tracing::debug!("Throughput refresher stopped");
        })
    }

    async fn most_recent_write_ms(&self) -> Result<Option<i64>, BrokerError> {
        let metrics = self.broker.last_entry_ms(STREAM_METRICS).await?;
        let raw = self.broker.last_entry_ms(STREAM_RAW).await?;
        Ok(metrics.max(raw))
    }
}

/// Default refresher interval
pub fn default_refresh_interval() -> Duration {
    Duration::from_secs(AUTO_REFRESH_INTERVAL_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(curve: DecayCurve, window_min: u32, min_factor: f64, steepness: f64) -> ThroughputConfig {
        ThroughputConfig {
            freshness_window_minutes: window_min,
            min_freshness_factor: min_factor,
            decay_curve: curve,
            decay_steepness: steepness,
            auto_refresh_enabled: false,
            base_multiplier: 6.0,
        }
    }

    #[test]
    fn test_fresh_write_yields_factor_one() {
        for curve in [DecayCurve::Linear, DecayCurve::Logarithmic, DecayCurve::Exponential, DecayCurve::Sqrt] {
            let c = config(curve, 60, 0.3, 1.0);
            assert_eq!(freshness_factor(&c, 0.0), 1.0, "{:?}", curve);
        }
    }

    #[test]
    fn test_factor_stays_in_bounds_at_window_extremes() {
        for curve in [DecayCurve::Linear, DecayCurve::Logarithmic, DecayCurve::Exponential, DecayCurve::Sqrt] {
            for window in [10, 180] {
                for steepness in [0.1, 2.0] {
                    let c = config(curve, window, 0.1, steepness);
                    for age_minutes in [0.0, 5.0, 60.0, 400.0, 10_000.0] {
                        let f = freshness_factor(&c, age_minutes * 60.0);
                        assert!((0.1..=1.0).contains(&f), "{:?} w={} s={} a={} -> {}", curve, window, steepness, age_minutes, f);
                    }
                }
            }
        }
    }

    #[test]
    fn test_logarithmic_value_at_three_quarters_window() {
        // 45 minutes into a 60-minute window, steepness 1.0
        let c = config(DecayCurve::Logarithmic, 60, 0.1, 1.0);
        let expected = 1.0 - (1.75_f64).ln() / (2.0_f64).ln();
        assert!((freshness_factor(&c, 45.0 * 60.0) - expected).abs() < 1e-9);

        // With the 0.3 floor the same age clamps up
        let floored = config(DecayCurve::Logarithmic, 60, 0.3, 1.0);
        assert_eq!(freshness_factor(&floored, 45.0 * 60.0), 0.3);
    }

    #[test]
    fn test_curves_decay_monotonically() {
        for curve in [DecayCurve::Linear, DecayCurve::Logarithmic, DecayCurve::Exponential, DecayCurve::Sqrt] {
            let c = config(curve, 60, 0.1, 1.0);
            let mut prev = f64::INFINITY;
            for age in [0.0, 600.0, 1_800.0, 3_600.0, 7_200.0] {
                let f = freshness_factor(&c, age);
                assert!(f <= prev, "{:?} not monotone at {}", curve, age);
                prev = f;
            }
        }
    }

    #[test]
    fn test_config_validation_ranges() {
        let mut c = ThroughputConfig::default();
        assert!(c.validate().is_ok());

        c.freshness_window_minutes = 5;
        assert!(c.validate().is_err());
        c.freshness_window_minutes = 60;

        c.min_freshness_factor = 0.9;
        assert!(c.validate().is_err());
        c.min_freshness_factor = 0.3;

        c.decay_steepness = 3.0;
        assert!(c.validate().is_err());
        c.decay_steepness = 1.0;

        c.base_multiplier = 1.0;
        assert!(c.validate().is_err());
    }

    #[tokio::test]
    async fn test_config_round_trip_and_reset() {
        let (_tx, shutdown_rx) = watch::channel(false);
        let (service, handle) = ConfigService::spawn(shutdown_rx);

        let updated = ThroughputConfig {
            freshness_window_minutes: 30,
            decay_curve: DecayCurve::Exponential,
            ..Default::default()
        };
        service.set(updated.clone()).await.unwrap();
        assert_eq!(service.get(), updated);

        // get -> put(same) -> get is identity
        service.set(service.get()).await.unwrap();
        assert_eq!(service.get(), updated);

        let restored = service.reset().await;
        assert_eq!(restored, ThroughputConfig::default());
        assert_eq!(service.get(), ThroughputConfig::default());

        // Rejected updates leave the config unchanged
        let bad = ThroughputConfig {
            base_multiplier: 100.0,
            ..Default::default()
        };
        assert!(service.set(bad).await.is_err());
        assert_eq!(service.get(), ThroughputConfig::default());

        handle.abort();
    }

    #[tokio::test]
    async fn test_estimate_over_live_stream() {
        let broker = BrokerService::memory();
        let (_tx, shutdown_rx) = watch::channel(false);
        let (service, config_handle) = ConfigService::spawn(shutdown_rx);
        let estimator = ThroughputEstimator::new(broker.clone(), service);

        // Empty cluster: base rate zero, factor floored
        let idle = estimator.estimate().await.unwrap();
        assert_eq!(idle.messages_per_second, 0);
        assert_eq!(idle.base_rate, 0.0);

        let raw = broker.stream::<MetricsSentinel>(STREAM_RAW);
        for _ in 0..60 {
            raw.publish(Some("V1"), None, &MetricsSentinel {
                source: "test".into(),
                emitted_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        }

        let estimate = estimator.estimate().await.unwrap();
        // 60 messages in the window: 1 msg/s, fresh factor 1.0, multiplier 6
        assert!((estimate.base_rate - 1.0).abs() < 1e-9);
        assert_eq!(estimate.freshness_factor, 1.0);
        assert_eq!(estimate.messages_per_second, 6);

        config_handle.abort();
    }

    #[tokio::test]
    async fn test_manual_refresh_publishes_sentinel() {
        let broker = BrokerService::memory();
        let (_tx, shutdown_rx) = watch::channel(false);
        let (service, config_handle) = ConfigService::spawn(shutdown_rx);
        let estimator = ThroughputEstimator::new(broker.clone(), service);

        estimator.refresh().await.unwrap();
        assert!(broker.last_entry_ms(STREAM_METRICS).await.unwrap().is_some());

        config_handle.abort();
    }

    #[tokio::test]
    async fn test_refresher_keeps_quiescent_stream_fresh() {
        let broker = BrokerService::memory();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (service, config_handle) = ConfigService::spawn(shutdown_rx.clone());
        let estimator = Arc::new(ThroughputEstimator::new(broker.clone(), service));

        let refresher = Arc::clone(&estimator)
            .start_refresher(Duration::from_millis(50), shutdown_rx);

        // With no genuine writes at all, sentinels appear on their own
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        loop {
            if broker.last_entry_ms(STREAM_METRICS).await.unwrap().is_some() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "no sentinel published");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let estimate = estimator.estimate().await.unwrap();
        assert!(estimate.last_write_age_seconds < 60.0);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), refresher)
            .await
            .unwrap()
            .unwrap();
        config_handle.abort();
    }
}
