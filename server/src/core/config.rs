use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use super::cli::CliConfig;
use super::constants::{
    CONFIG_FILE_NAME, DEFAULT_HOST, DEFAULT_PORT, ENV_CONFIG, MAX_CONSUMERS_PER_FAMILY,
};

// =============================================================================
// Cluster Mode Enum
// =============================================================================

/// Deployment mode; selects broker backend defaults
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    #[default]
    Development,
    Testing,
    Production,
}

impl ClusterMode {
    /// Default broker backend for this mode
    pub fn default_backend(&self) -> BrokerBackendType {
        match self {
            ClusterMode::Development => BrokerBackendType::Memory,
            ClusterMode::Testing | ClusterMode::Production => BrokerBackendType::Redis,
        }
    }
}

impl fmt::Display for ClusterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterMode::Development => write!(f, "development"),
            ClusterMode::Testing => write!(f, "testing"),
            ClusterMode::Production => write!(f, "production"),
        }
    }
}

// =============================================================================
// Broker Backend Enum
// =============================================================================

/// Stream broker backend type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackendType {
    #[default]
    Memory,
    Redis,
}

impl fmt::Display for BrokerBackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerBackendType::Memory => write!(f, "memory"),
            BrokerBackendType::Redis => write!(f, "redis"),
        }
    }
}

// =============================================================================
// File Config Structs (JSON deserialization)
// =============================================================================

/// Server configuration section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Cluster configuration section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ClusterFileConfig {
    pub mode: Option<ClusterMode>,
    pub enabled: Option<bool>,
    pub workers_per_family: Option<usize>,
    pub broker_url: Option<String>,
}

/// Root of the JSON config file
#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub cluster: ClusterFileConfig,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))
    }
}

// =============================================================================
// Resolved Config
// =============================================================================

/// HTTP server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Cluster settings
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub mode: ClusterMode,
    /// When false, only the ingest API runs; no workers, aggregator, or
    /// bridge are started.
    pub enabled: bool,
    pub workers_per_family: usize,
    pub broker_backend: BrokerBackendType,
    pub broker_url: Option<String>,
}

/// Fully resolved application configuration.
///
/// Layering: CLI (and its bound env vars) > config file > mode defaults.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub cluster: ClusterConfig,
}

impl AppConfig {
    pub fn load(cli: &CliConfig) -> Result<Self> {
        let file = Self::resolve_config_path(cli)
            .map(|path| FileConfig::load(&path))
            .transpose()?
            .unwrap_or_default();

        let mode = cli.mode.or(file.cluster.mode).unwrap_or_default();
        let broker_url = cli.broker_url.clone().or(file.cluster.broker_url);
        // An explicit broker URL opts into Redis even in development
        let broker_backend = if broker_url.is_some() {
            BrokerBackendType::Redis
        } else {
            mode.default_backend()
        };

        if broker_backend == BrokerBackendType::Redis && broker_url.is_none() {
            bail!(
                "cluster mode '{}' requires a broker URL (BROKER_URL or --broker-url)",
                mode
            );
        }

        let workers_per_family = cli
            .workers_per_family
            .or(file.cluster.workers_per_family)
            .unwrap_or(2);
        if workers_per_family == 0 || workers_per_family > MAX_CONSUMERS_PER_FAMILY {
            bail!(
                "workers_per_family must be between 1 and {}, got {}",
                MAX_CONSUMERS_PER_FAMILY,
                workers_per_family
            );
        }

        Ok(Self {
            server: ServerConfig {
                host: cli
                    .host
                    .clone()
                    .or(file.server.host)
                    .unwrap_or_else(|| DEFAULT_HOST.to_string()),
                port: cli.port.or(file.server.port).unwrap_or(DEFAULT_PORT),
            },
            cluster: ClusterConfig {
                mode,
                enabled: cli.cluster_enabled.unwrap_or(file.cluster.enabled.unwrap_or(true)),
                workers_per_family,
                broker_backend,
                broker_url,
            },
        })
    }

    /// Explicit path from CLI/env wins; otherwise the file is optional and
    /// only picked up when present in the working directory.
    fn resolve_config_path(cli: &CliConfig) -> Option<PathBuf> {
        if let Some(path) = &cli.config {
            return Some(path.clone());
        }
        if let Ok(path) = std::env::var(ENV_CONFIG) {
            return Some(PathBuf::from(path));
        }
        let local = PathBuf::from(CONFIG_FILE_NAME);
        local.exists().then_some(local)
    }
}
