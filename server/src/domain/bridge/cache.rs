//! Adaptive replay cache
//!
//! Bounded per-(vehicle, stream) rings of recent push messages, replayed to
//! newly attached subscribers. The per-key budget adapts to push pressure:
//! rising subscriber push latency shrinks the rings, idle periods grow them
//! back toward the ceiling.

use std::collections::{HashMap, VecDeque};

use crate::core::constants::{
    BRIDGE_PRESSURE_LATENCY_MS, REPLAY_CACHE_INITIAL, REPLAY_CACHE_MAX, REPLAY_CACHE_MIN,
};
use crate::data::types::PushMessage;

/// Which stream a cached message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Fault,
    Health,
}

/// Maximum distinct (vehicle, stream) keys kept; least-recently-updated keys
/// are evicted beyond this.
const MAX_KEYS: usize = 4096;

/// Cache counters for the status API
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    pub per_key_budget: u64,
}

pub struct ReplayCache {
    rings: HashMap<(String, StreamKind), VecDeque<PushMessage>>,
    /// Recency order of keys, most recent at the back
    recency: VecDeque<(String, StreamKind)>,
    per_key: usize,
    hits: u64,
    misses: u64,
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayCache {
    pub fn new() -> Self {
        Self {
            rings: HashMap::new(),
            recency: VecDeque::new(),
            per_key: REPLAY_CACHE_INITIAL,
            hits: 0,
            misses: 0,
        }
    }

    /// Record a live message for later replay
    pub fn record(&mut self, kind: StreamKind, message: &PushMessage) {
        let key = (message.vehicle_id().to_string(), kind);
        let ring = self.rings.entry(key.clone()).or_default();
        ring.push_back(message.clone());
        while ring.len() > self.per_key {
            ring.pop_front();
        }

        self.recency.retain(|k| *k != key);
        self.recency.push_back(key);
        while self.recency.len() > MAX_KEYS {
            if let Some(old) = self.recency.pop_front() {
                self.rings.remove(&old);
            }
        }
    }

    /// Everything cached, oldest first per key; used to warm a new
    /// subscriber's queue
    pub fn replay_all(&mut self) -> Vec<PushMessage> {
        let mut messages = Vec::new();
        for key in &self.recency {
            if let Some(ring) = self.rings.get(key) {
                messages.extend(ring.iter().cloned());
            }
        }
        if messages.is_empty() {
            self.misses += 1;
        } else {
            self.hits += 1;
        }
        messages
    }

    /// Feed an observed push latency; shrink under pressure, grow when calm
    pub fn observe_push_latency(&mut self, latency_ms: u64) {
        if latency_ms > BRIDGE_PRESSURE_LATENCY_MS {
            let target = (self.per_key / 2).max(REPLAY_CACHE_MIN);
            if target != self.per_key {
                tracing::debug!(from = self.per_key, to = target, "Replay cache shrinking under pressure");
                self.per_key = target;
                for ring in self.rings.values_mut() {
                    while ring.len() > target {
                        ring.pop_front();
                    }
                }
            }
        } else if self.per_key < REPLAY_CACHE_MAX {
            self.per_key += 1;
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.rings.values().map(|r| r.len() as u64).sum(),
            per_key_budget: self.per_key as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::{FaultFamily, FaultScore, FaultStatus};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn message(vehicle: &str, severity: f64) -> PushMessage {
        PushMessage::FaultScore(FaultScore {
            vehicle_id: vehicle.into(),
            sample_timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            family: FaultFamily::Bearing,
            severity,
            status: FaultStatus::Normal,
            features: BTreeMap::new(),
            produced_by: "test".into(),
            processing_latency_ms: 1,
        })
    }

    #[test]
    fn test_ring_is_bounded_per_key() {
        let mut cache = ReplayCache::new();
        for i in 0..100 {
            cache.record(StreamKind::Fault, &message("V1", i as f64 / 100.0));
        }
        let stats = cache.stats();
        assert_eq!(stats.entries, REPLAY_CACHE_INITIAL as u64);
    }

    #[test]
    fn test_replay_returns_messages_and_counts_hits() {
        let mut cache = ReplayCache::new();
        assert!(cache.replay_all().is_empty());
        assert_eq!(cache.stats().misses, 1);

        cache.record(StreamKind::Fault, &message("V1", 0.1));
        cache.record(StreamKind::Health, &message("V1", 0.2));
        let replayed = cache.replay_all();
        assert_eq!(replayed.len(), 2);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_pressure_shrinks_and_calm_grows() {
        let mut cache = ReplayCache::new();
        for i in 0..REPLAY_CACHE_INITIAL {
            cache.record(StreamKind::Fault, &message("V1", i as f64));
        }

        cache.observe_push_latency(BRIDGE_PRESSURE_LATENCY_MS * 10);
        let shrunk = cache.stats();
        assert_eq!(shrunk.per_key_budget, (REPLAY_CACHE_INITIAL / 2) as u64);
        assert_eq!(shrunk.entries, (REPLAY_CACHE_INITIAL / 2) as u64);

        // Sustained pressure bottoms out at the floor
        for _ in 0..20 {
            cache.observe_push_latency(BRIDGE_PRESSURE_LATENCY_MS * 10);
        }
        assert_eq!(cache.stats().per_key_budget, REPLAY_CACHE_MIN as u64);

        // Calm pushes grow the budget back toward the ceiling
        for _ in 0..1000 {
            cache.observe_push_latency(1);
        }
        assert_eq!(cache.stats().per_key_budget, REPLAY_CACHE_MAX as u64);
    }

    #[test]
    fn test_key_eviction_is_least_recently_updated() {
        let mut cache = ReplayCache::new();
        for i in 0..(MAX_KEYS + 10) {
            cache.record(StreamKind::Fault, &message(&format!("V{}", i), 0.1));
        }
        let replayed = cache.replay_all();
        assert_eq!(replayed.len(), MAX_KEYS);
        // The first ten vehicles were evicted
        assert!(!replayed.iter().any(|m| m.vehicle_id() == "V0"));
        assert!(replayed.iter().any(|m| m.vehicle_id() == "V10"));
    }
}
