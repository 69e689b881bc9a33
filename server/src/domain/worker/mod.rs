//! Worker nodes and the per-family worker pool

mod node;
mod pool;

pub use node::{WorkerMetrics, WorkerNode, WorkerOptions};
pub use pool::{PoolCounters, WorkerPool};
