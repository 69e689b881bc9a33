//! API server initialization

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use tokio::net::TcpListener;
use tower_http::compression::CompressionLayer;

use super::middleware;
use super::openapi::openapi_json;
use super::routes::{alerts, config, health, ingest, system, vehicles, ws};
use crate::core::config::AppConfig;
use crate::core::constants::DEFAULT_BODY_LIMIT;
use crate::core::shutdown::ShutdownService;
use crate::data::broker::BrokerService;
use crate::domain::aggregator::AggregatorState;
use crate::domain::bridge::BridgeState;
use crate::domain::coordinator::CoordinatorState;
use crate::domain::throughput::ThroughputEstimator;
use crate::domain::worker::WorkerPool;

/// Everything the route tree needs
pub struct ApiServer {
    pub config: AppConfig,
    pub broker: BrokerService,
    pub aggregator: Arc<AggregatorState>,
    pub coordinator: Arc<CoordinatorState>,
    pub bridge: Arc<BridgeState>,
    pub pool: Option<Arc<WorkerPool>>,
    pub estimator: Arc<ThroughputEstimator>,
    pub shutdown: ShutdownService,
}

impl ApiServer {
    /// Assemble the full route tree
    pub fn router(&self) -> Router {
        let health_routes = Router::new()
            .route("/health", get(health::health))
            .with_state(self.broker.clone());

        let vehicle_routes = ingest::routes(self.broker.clone()).merge(vehicles::routes(
            self.broker.clone(),
            Arc::clone(&self.aggregator),
        ));

        let system_state = system::SystemState {
            broker: self.broker.clone(),
            cluster: self.config.cluster.clone(),
            coordinator: Arc::clone(&self.coordinator),
            aggregator: Arc::clone(&self.aggregator),
            bridge: Arc::clone(&self.bridge),
            pool: self.pool.clone(),
            estimator: Arc::clone(&self.estimator),
            started_at: Instant::now(),
        };

        Router::new()
            .route("/api/openapi.json", get(openapi_json))
            .nest("/api/v1", health_routes)
            .nest("/vehicles", vehicle_routes)
            .nest("/alerts", alerts::routes(Arc::clone(&self.aggregator)))
            .nest("/system", system::routes(system_state))
            .nest("/config", config::routes(Arc::clone(&self.estimator)))
            .merge(ws::routes(Arc::clone(&self.bridge), self.shutdown.subscribe()))
            .fallback(middleware::handle_404)
            .layer(CompressionLayer::new())
            .layer(middleware::cors())
            .layer(DefaultBodyLimit::max(DEFAULT_BODY_LIMIT))
    }

    /// Bind and serve until the shutdown signal fires
    pub async fn start(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config.server.host.parse()?,
            self.config.server.port,
        );
        let shutdown = self.shutdown.clone();
        let router = self.router();

        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %addr, "API server listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.wait())
            .await?;

        Ok(())
    }
}
