//! Data layer
//!
//! - `broker` — stream broker adapter (memory and Redis Streams backends)
//! - `types` — wire-level message bodies and classification enums

pub mod broker;
pub mod types;

pub use broker::{BrokerError, BrokerService, GroupStart};
