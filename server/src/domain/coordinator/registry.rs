//! Worker registry
//!
//! Fed from the heartbeat stream; the coordinator task is the single writer
//! and API handlers read copy-on-read snapshots. Eviction is by heartbeat
//! TTL with an inclusive liveness boundary: a heartbeat aged exactly the TTL
//! still counts as live.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::data::types::{WorkerRegistration, WorkerState};

pub struct WorkerRegistry {
    ttl: chrono::Duration,
    live: RwLock<HashMap<String, WorkerRegistration>>,
    /// Last coherent snapshot, served while the registry is degraded
    last_good: RwLock<Vec<WorkerRegistration>>,
    pub evictions: AtomicU64,
}

impl WorkerRegistry {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: chrono::Duration::seconds(ttl_secs as i64),
            live: RwLock::new(HashMap::new()),
            last_good: RwLock::new(Vec::new()),
            evictions: AtomicU64::new(0),
        }
    }

    /// Fold one heartbeat in. A `Stopped` heartbeat is a deregistration.
    /// Returns true when this created a new registration.
    pub fn apply(&self, registration: WorkerRegistration) -> bool {
        let mut live = self.live.write();
        if registration.state == WorkerState::Stopped {
            live.remove(&registration.worker_id);
            return false;
        }
        live.insert(registration.worker_id.clone(), registration)
            .is_none()
    }

    /// Evict workers whose heartbeat is older than the TTL (strictly:
    /// `now - last_heartbeat > ttl`). Returns the evicted registrations.
    pub fn evict_stale(&self, now: DateTime<Utc>) -> Vec<WorkerRegistration> {
        let mut live = self.live.write();
        let cutoff = now - self.ttl;
        let stale: Vec<String> = live
            .values()
            .filter(|w| w.last_heartbeat < cutoff)
            .map(|w| w.worker_id.clone())
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for worker_id in stale {
            if let Some(registration) = live.remove(&worker_id) {
                evicted.push(registration);
            }
        }
        self.evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        evicted
    }

    /// Copy-on-read snapshot of the live set
    pub fn snapshot(&self) -> Vec<WorkerRegistration> {
        self.live.read().values().cloned().collect()
    }

    /// Refresh the degraded-mode fallback from the current live set
    pub fn commit_good_snapshot(&self) {
        *self.last_good.write() = self.snapshot();
    }

    /// Fallback snapshot for degraded operation
    pub fn last_good_snapshot(&self) -> Vec<WorkerRegistration> {
        self.last_good.read().clone()
    }

    pub fn len(&self) -> usize {
        self.live.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::{FaultFamily, WorkerLoad};
    use chrono::TimeZone;

    fn registration(worker_id: &str, heartbeat_secs: i64, state: WorkerState) -> WorkerRegistration {
        WorkerRegistration {
            worker_id: worker_id.into(),
            families: vec![FaultFamily::Bearing],
            bind_address: "127.0.0.1:0".into(),
            started_at: Utc.timestamp_opt(heartbeat_secs - 100, 0).unwrap(),
            last_heartbeat: Utc.timestamp_opt(heartbeat_secs, 0).unwrap(),
            state,
            load: WorkerLoad::default(),
        }
    }

    #[test]
    fn test_apply_and_snapshot() {
        let registry = WorkerRegistry::new(15);
        assert!(registry.apply(registration("w1", 1000, WorkerState::Running)));
        // Refresh is not a new registration
        assert!(!registry.apply(registration("w1", 1005, WorkerState::Running)));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.snapshot()[0].last_heartbeat.timestamp(),
            1005
        );
    }

    #[test]
    fn test_stopped_heartbeat_deregisters() {
        let registry = WorkerRegistry::new(15);
        registry.apply(registration("w1", 1000, WorkerState::Running));
        registry.apply(registration("w1", 1001, WorkerState::Stopped));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_ttl_boundary_is_inclusive() {
        let registry = WorkerRegistry::new(15);
        registry.apply(registration("w1", 1000, WorkerState::Running));

        // Exactly at the TTL: still live
        let evicted = registry.evict_stale(Utc.timestamp_opt(1015, 0).unwrap());
        assert!(evicted.is_empty());
        assert_eq!(registry.len(), 1);

        // One past the TTL: evicted
        let evicted = registry.evict_stale(Utc.timestamp_opt(1016, 0).unwrap());
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].worker_id, "w1");
        assert!(registry.is_empty());
        assert_eq!(registry.evictions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_last_good_snapshot_survives_eviction() {
        let registry = WorkerRegistry::new(15);
        registry.apply(registration("w1", 1000, WorkerState::Running));
        registry.commit_good_snapshot();
        registry.evict_stale(Utc.timestamp_opt(2000, 0).unwrap());

        assert!(registry.is_empty());
        assert_eq!(registry.last_good_snapshot().len(), 1);
    }
}
