//! Core application infrastructure

pub mod cli;
pub mod config;
pub mod constants;
pub mod shutdown;

pub use crate::app::ClusterApp;
pub use cli::{CliConfig, Commands};
pub use config::{AppConfig, BrokerBackendType, ClusterConfig, ClusterMode, ServerConfig};
pub use shutdown::ShutdownService;
