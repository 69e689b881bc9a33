//! Multi-dimensional worker load scoring
//!
//! Produces a composite score in [0, 1] per live worker. Used for advisory
//! routing ("which worker should the next assignment favor") and to bias
//! scaling decisions; actual per-message dispatch stays with the broker's
//! group semantics.

use crate::core::constants::{
    LOAD_LATENCY_CEILING_MS, LOAD_QUEUE_CEILING, LOAD_WEIGHT_CPU, LOAD_WEIGHT_MEM,
    LOAD_WEIGHT_QUEUE, LOAD_WEIGHT_RESPONSE_TIME, LOAD_WEIGHT_SUCCESS_RATE,
};
use crate::data::types::{FaultFamily, WorkerRegistration, WorkerState};

/// Health multiplier by lifecycle state. Degraded workers keep consuming
/// but are deprioritized; everything else is unschedulable.
fn health_factor(state: WorkerState) -> f64 {
    match state {
        WorkerState::Running => 1.0,
        WorkerState::Degraded => 0.5,
        _ => 0.0,
    }
}

/// Composite load score for one worker
pub fn load_score(registration: &WorkerRegistration) -> f64 {
    let load = &registration.load;
    let norm_latency = (load.avg_latency_ms / LOAD_LATENCY_CEILING_MS).clamp(0.0, 1.0);
    let cpu = (load.cpu_pct / 100.0).clamp(0.0, 1.0);
    let mem = (load.mem_pct / 100.0).clamp(0.0, 1.0);
    let queue_pressure = (load.queue_length as f64 / LOAD_QUEUE_CEILING).clamp(0.0, 1.0);
    let success_rate = load.success_rate.clamp(0.0, 1.0);

    health_factor(registration.state)
        * (LOAD_WEIGHT_RESPONSE_TIME * (1.0 - norm_latency)
            + LOAD_WEIGHT_SUCCESS_RATE * success_rate
            + LOAD_WEIGHT_CPU * (1.0 - cpu)
            + LOAD_WEIGHT_MEM * (1.0 - mem)
            + LOAD_WEIGHT_QUEUE * (1.0 - queue_pressure))
}

/// Best-scoring live worker for a family, if any
pub fn best_worker<'a>(
    workers: impl IntoIterator<Item = &'a WorkerRegistration>,
    family: FaultFamily,
) -> Option<&'a WorkerRegistration> {
    workers
        .into_iter()
        .filter(|w| w.families.contains(&family))
        .max_by(|a, b| {
            load_score(a)
                .partial_cmp(&load_score(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::WorkerLoad;
    use chrono::Utc;

    fn registration(worker_id: &str, state: WorkerState, load: WorkerLoad) -> WorkerRegistration {
        WorkerRegistration {
            worker_id: worker_id.into(),
            families: vec![FaultFamily::Bearing],
            bind_address: "127.0.0.1:0".into(),
            started_at: Utc::now(),
            last_heartbeat: Utc::now(),
            state,
            load,
        }
    }

    fn idle_load() -> WorkerLoad {
        WorkerLoad {
            pending_backlog: 0,
            cpu_pct: 5.0,
            mem_pct: 10.0,
            avg_latency_ms: 10.0,
            success_rate: 1.0,
            queue_length: 1,
        }
    }

    #[test]
    fn test_idle_healthy_worker_scores_near_one() {
        let score = load_score(&registration("w", WorkerState::Running, idle_load()));
        assert!(score > 0.9, "got {}", score);
        assert!(score <= 1.0);
    }

    #[test]
    fn test_saturated_worker_scores_low() {
        let load = WorkerLoad {
            pending_backlog: 500,
            cpu_pct: 100.0,
            mem_pct: 100.0,
            avg_latency_ms: 1000.0,
            success_rate: 0.5,
            queue_length: 500,
        };
        let score = load_score(&registration("w", WorkerState::Running, load));
        // Only the success-rate term contributes
        assert!((score - LOAD_WEIGHT_SUCCESS_RATE * 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_degraded_worker_is_deprioritized() {
        let running = registration("a", WorkerState::Running, idle_load());
        let degraded = registration("b", WorkerState::Degraded, idle_load());
        assert!(load_score(&running) > load_score(&degraded));

        let best = best_worker([&degraded, &running], FaultFamily::Bearing).unwrap();
        assert_eq!(best.worker_id, "a");
    }

    #[test]
    fn test_draining_worker_scores_zero() {
        let score = load_score(&registration("w", WorkerState::Draining, idle_load()));
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_best_worker_filters_by_family() {
        let reg = registration("a", WorkerState::Running, idle_load());
        assert!(best_worker([&reg], FaultFamily::Insulation).is_none());
        assert!(best_worker([&reg], FaultFamily::Bearing).is_some());
    }
}
