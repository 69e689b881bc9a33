//! Cluster supervisor
//!
//! Owns the lifecycle: broker reachable first, then coordinator, result
//! aggregator, workers, frontend bridge, and the throughput refresher, each
//! waiting for the previous to be ready (a component's `start` resolves once
//! it is subscribed). Shutdown runs the same chain in reverse under the
//! bounded budget in `ShutdownService`; a second signal aborts immediately.

use std::sync::Arc;

use anyhow::Result;

use crate::api::ApiServer;
use crate::core::cli::{self, Commands};
use crate::core::config::{AppConfig, BrokerBackendType};
use crate::core::constants::{
    APP_NAME, APP_NAME_LOWER, ENV_LOG, EXIT_BROKER_UNREACHABLE, EXIT_CONFIG, EXIT_OK,
};
use crate::core::shutdown::ShutdownService;
use crate::data::broker::BrokerService;
use crate::data::types::FaultFamily;
use crate::domain::aggregator::{AggregatorOptions, AggregatorState, HealthAggregator};
use crate::domain::bridge::{BridgeOptions, BridgeState, FrontendBridge};
use crate::domain::coordinator::{Coordinator, CoordinatorOptions, CoordinatorState};
use crate::domain::throughput::{
    ConfigService, ThroughputEstimator, default_refresh_interval,
};
use crate::domain::worker::{WorkerOptions, WorkerPool};

pub struct ClusterApp {
    pub config: AppConfig,
    pub broker: BrokerService,
    pub shutdown: ShutdownService,
    pub aggregator: Arc<AggregatorState>,
    pub coordinator: Arc<CoordinatorState>,
    pub bridge: Arc<BridgeState>,
    pub pool: Option<Arc<WorkerPool>>,
    pub estimator: Arc<ThroughputEstimator>,
}

impl ClusterApp {
    /// Run the application; returns the process exit code
    pub async fn run() -> i32 {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("{} starting", APP_NAME);

        let (cli_config, command) = cli::parse();

        let config = match AppConfig::load(&cli_config) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Configuration error: {e:#}");
                return EXIT_CONFIG;
            }
        };

        match command {
            Some(Commands::Status { url }) => return Self::handle_status(&config, url).await,
            Some(Commands::Scale { family, count, url }) => {
                return Self::handle_scale(&config, family, count, url).await;
            }
            Some(Commands::Start) | None => {}
        }

        let broker = match Self::connect_broker(&config).await {
            Ok(broker) => broker,
            Err(e) => {
                tracing::error!(error = %e, "Broker unreachable at startup");
                eprintln!("Broker unreachable: {e}");
                return EXIT_BROKER_UNREACHABLE;
            }
        };

        let app = match Self::init(config, broker).await {
            Ok(app) => app,
            Err(e) => {
                tracing::error!(error = %e, "Cluster initialization failed");
                eprintln!("Error: {e:#}");
                return 1;
            }
        };

        match app.serve().await {
            Ok(()) => EXIT_OK,
            Err(e) => {
                tracing::error!(error = %e, "Server error");
                eprintln!("Error: {e:#}");
                1
            }
        }
    }

    /// Step one of the startup order: a reachable broker
    async fn connect_broker(config: &AppConfig) -> Result<BrokerService, crate::data::BrokerError> {
        let broker = match config.cluster.broker_backend {
            BrokerBackendType::Memory => BrokerService::memory(),
            BrokerBackendType::Redis => {
                let url = config
                    .cluster
                    .broker_url
                    .as_deref()
                    .expect("redis backend validated at config load");
                BrokerService::connect_redis(url).await?
            }
        };
        broker.health_check().await?;
        tracing::info!(
            backend = broker.backend_name(),
            mode = %config.cluster.mode,
            "Broker ready"
        );
        Ok(broker)
    }

    /// Bring the components up in dependency order. Each `start` resolves
    /// once the component is subscribed, which is its ready gate.
    pub async fn init(config: AppConfig, broker: BrokerService) -> Result<Self> {
        let shutdown = ShutdownService::new();
        let enabled = config.cluster.enabled;
        let bind_address = format!("{}:{}", config.server.host, config.server.port);

        // Throughput config state exists regardless; the API serves it even
        // with the cluster disabled
        let (config_service, config_handle) = ConfigService::spawn(shutdown.subscribe());
        shutdown.register(config_handle).await;
        let estimator = Arc::new(ThroughputEstimator::new(broker.clone(), config_service));

        // Coordinator
        let coordinator = Coordinator::new(broker.clone(), CoordinatorOptions::default());
        let coordinator_state = coordinator.state();
        if enabled {
            shutdown
                .register(coordinator.start(shutdown.subscribe()).await?)
                .await;
            tracing::debug!("Coordinator ready");
        }

        // Result aggregator
        let aggregator = HealthAggregator::new(broker.clone(), AggregatorOptions::default());
        let aggregator_state = aggregator.state();
        if enabled {
            shutdown
                .register(aggregator.start(shutdown.subscribe()).await?)
                .await;
            tracing::debug!("Result aggregator ready");
        }

        // Workers, grouped by family
        let pool = if enabled {
            let pool = WorkerPool::start(
                broker.clone(),
                bind_address,
                config.cluster.workers_per_family,
                WorkerOptions::default(),
                &shutdown,
            )
            .await?;
            tracing::info!(
                workers_per_family = config.cluster.workers_per_family,
                families = FaultFamily::ALL.len(),
                "Worker pool ready"
            );
            Some(pool)
        } else {
            tracing::warn!("Cluster disabled; running ingest API only");
            None
        };

        // Frontend bridge
        let bridge = FrontendBridge::new(broker.clone(), BridgeOptions::default());
        let bridge_state = bridge.state();
        if enabled {
            for handle in bridge.start(shutdown.subscribe()).await? {
                shutdown.register(handle).await;
            }
            tracing::debug!("Frontend bridge ready");
        }

        // Throughput refresher last
        if enabled {
            shutdown
                .register(
                    Arc::clone(&estimator)
                        .start_refresher(default_refresh_interval(), shutdown.subscribe()),
                )
                .await;
            tracing::debug!("Throughput refresher ready");
        }

        Ok(Self {
            config,
            broker,
            shutdown,
            aggregator: aggregator_state,
            coordinator: coordinator_state,
            bridge: bridge_state,
            pool,
            estimator,
        })
    }

    /// Serve the API until a shutdown signal, then drain the cluster
    async fn serve(self) -> Result<()> {
        self.shutdown.install_signal_handlers();

        let shutdown = self.shutdown.clone();
        let server = ApiServer {
            config: self.config,
            broker: self.broker,
            aggregator: self.aggregator,
            coordinator: self.coordinator,
            bridge: self.bridge,
            pool: self.pool,
            estimator: self.estimator,
            shutdown: shutdown.clone(),
        };
        server.start().await?;

        // Reverse-order drain with the bounded budget
        shutdown.shutdown().await;
        Ok(())
    }

    fn init_logging() {
        let default_filter = format!("info,{}=info", APP_NAME_LOWER);

        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(default_filter);

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    // ========================================================================
    // OPERATOR COMMANDS
    // ========================================================================

    async fn handle_status(config: &AppConfig, url: Option<String>) -> i32 {
        let base = url.unwrap_or_else(|| config.server.base_url());
        match reqwest::get(format!("{}/system/status", base)).await {
            Ok(response) if response.status().is_success() => {
                match response.json::<serde_json::Value>().await {
                    Ok(status) => {
                        println!("{}", serde_json::to_string_pretty(&status).unwrap_or_default());
                        EXIT_OK
                    }
                    Err(e) => {
                        eprintln!("Malformed status response: {e}");
                        1
                    }
                }
            }
            Ok(response) => {
                eprintln!("Server returned {}", response.status());
                1
            }
            Err(e) => {
                eprintln!("Could not reach {}: {e}", base);
                1
            }
        }
    }

    async fn handle_scale(
        config: &AppConfig,
        family: FaultFamily,
        count: usize,
        url: Option<String>,
    ) -> i32 {
        let base = url.unwrap_or_else(|| config.server.base_url());
        let client = reqwest::Client::new();
        let result = client
            .post(format!("{}/system/scale", base))
            .json(&serde_json::json!({"family": family, "new_count": count}))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                println!("Scale command accepted: {} -> {}", family, count);
                EXIT_OK
            }
            Ok(response) => {
                eprintln!("Server rejected scale command: {}", response.status());
                1
            }
            Err(e) => {
                eprintln!("Could not reach {}: {e}", base);
                1
            }
        }
    }
}
