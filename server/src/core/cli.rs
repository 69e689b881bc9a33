use std::path::PathBuf;

use clap::{Parser, Subcommand};

use super::config::ClusterMode;
use super::constants::{
    ENV_BROKER_URL, ENV_CLUSTER_ENABLED, ENV_CLUSTER_MODE, ENV_CONFIG, ENV_HOST, ENV_PORT,
    ENV_WORKERS_PER_FAMILY,
};
use crate::data::types::FaultFamily;

#[derive(Parser)]
#[command(name = "fleetdiag")]
#[command(version, about = "Distributed motor-fault diagnosis cluster", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Server host address
    #[arg(long, short = 'H', global = true, env = ENV_HOST)]
    pub host: Option<String>,

    /// Server port
    #[arg(long, short = 'p', global = true, env = ENV_PORT)]
    pub port: Option<u16>,

    /// Path to config file
    #[arg(long, short = 'c', global = true, env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    /// Cluster mode (development, testing, production)
    #[arg(long, global = true, env = ENV_CLUSTER_MODE, value_parser = parse_cluster_mode)]
    pub mode: Option<ClusterMode>,

    /// Initial consumer count per fault family
    #[arg(long, global = true, env = ENV_WORKERS_PER_FAMILY)]
    pub workers_per_family: Option<usize>,

    /// Broker connection URL (Redis); implies the redis backend
    #[arg(long, global = true, env = ENV_BROKER_URL)]
    pub broker_url: Option<String>,

    /// Enable or disable the diagnosis cluster (ingest API always runs)
    #[arg(long, global = true, env = ENV_CLUSTER_ENABLED)]
    pub cluster_enabled: Option<bool>,
}

/// Parse cluster mode from CLI/env string
fn parse_cluster_mode(s: &str) -> Result<ClusterMode, String> {
    match s.to_lowercase().as_str() {
        "development" | "dev" => Ok(ClusterMode::Development),
        "testing" | "test" => Ok(ClusterMode::Testing),
        "production" | "prod" => Ok(ClusterMode::Production),
        _ => Err(format!(
            "Invalid cluster mode '{}'. Valid options: development, testing, production",
            s
        )),
    }
}

/// Parse fault family from CLI string
fn parse_fault_family(s: &str) -> Result<FaultFamily, String> {
    s.parse()
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Start the cluster (default command)
    Start,
    /// Query cluster-wide status from a running server
    Status {
        /// Server base URL (defaults to the configured host/port)
        #[arg(long)]
        url: Option<String>,
    },
    /// Resize a fault family's consumer pool on a running server
    Scale {
        /// Fault family to resize
        #[arg(value_parser = parse_fault_family)]
        family: FaultFamily,
        /// Target consumer count
        count: usize,
        /// Server base URL (defaults to the configured host/port)
        #[arg(long)]
        url: Option<String>,
    },
}

/// Configuration derived from CLI arguments
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub config: Option<PathBuf>,
    pub mode: Option<ClusterMode>,
    pub workers_per_family: Option<usize>,
    pub broker_url: Option<String>,
    pub cluster_enabled: Option<bool>,
}

/// Parse CLI arguments and return config with command
pub fn parse() -> (CliConfig, Option<Commands>) {
    let cli = Cli::parse();
    let config = CliConfig {
        host: cli.host,
        port: cli.port,
        config: cli.config,
        mode: cli.mode,
        workers_per_family: cli.workers_per_family,
        broker_url: cli.broker_url,
        cluster_enabled: cli.cluster_enabled,
    };
    (config, cli.command)
}
