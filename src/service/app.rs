//! Main application state and service coordination
//!
//! `AppState` owns the engine, the player API server, the metrics service and
//! the background tasks, and starts and stops them in order.

use crate::config::{validate_config, AppConfig};
use crate::matchmaking::{AllocationProvider, LoopbackAllocationProvider, MatchmakingEngine};
use crate::metrics::{HealthServer, HealthServerConfig, MetricsCollector, MetricsService};
use crate::service::api::{ApiServer, ApiServerConfig};
use crate::service::health::{HealthCheck, HealthStatus};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

const STATS_INTERVAL: Duration = Duration::from_secs(15);

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

/// Main application state containing all service components
pub struct AppState {
    config: AppConfig,

    /// Core matchmaking engine
    engine: MatchmakingEngine,

    /// Player-facing HTTP API
    api_server: Arc<ApiServer>,

    /// Metrics service for monitoring and health checks
    metrics_service: Arc<MetricsService>,

    /// Background task handles
    background_tasks: Vec<JoinHandle<()>>,

    is_running: Arc<RwLock<bool>>,
}

impl AppState {
    /// Initialize the application against the loopback allocation provider
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        let provider = Arc::new(LoopbackAllocationProvider::new(
            config.provider.loopback_host.clone(),
            config.provider.loopback_port,
            config.provider.loopback_ready_after_polls,
        ));

        Self::with_provider(config, provider).await
    }

    /// Initialize the application against any allocation provider
    pub async fn with_provider(
        config: AppConfig,
        provider: Arc<dyn AllocationProvider>,
    ) -> Result<Self, ServiceError> {
        info!("Initializing {} matchmaking service", config.service.name);

        validate_config(&config).map_err(|e| ServiceError::Configuration {
            message: e.to_string(),
        })?;

        info!(
            "Configuration: fleet={}, region={}, profile={}, match_size={}",
            config.provider.fleet_id,
            config.provider.region_id,
            config.provider.profile_id,
            config.matchmaking.match_size
        );

        let metrics_collector =
            Arc::new(
                MetricsCollector::new().map_err(|e| ServiceError::Initialization {
                    message: format!("Failed to create metrics collector: {}", e),
                })?,
            );

        let engine = MatchmakingEngine::with_metrics(
            provider,
            config.engine_settings(),
            metrics_collector.clone(),
        );

        let metrics_service = Self::initialize_metrics(&config, metrics_collector, &engine);

        let api_server = Arc::new(ApiServer::new(
            ApiServerConfig {
                host: "0.0.0.0".to_string(),
                port: config.service.http_port,
            },
            engine.clone(),
        ));

        Ok(Self {
            config,
            engine,
            api_server,
            metrics_service,
            background_tasks: Vec::new(),
            is_running: Arc::new(RwLock::new(false)),
        })
    }

    /// Start the coordinator, both HTTP servers and the background tasks
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        info!("Starting {} matchmaking service", self.config.service.name);

        *self.is_running.write().await = true;

        self.start_metrics_service().await;

        let coordinator =
            self.engine
                .start()
                .map_err(|e| ServiceError::Initialization {
                    message: format!("Failed to start matchmaking coordinator: {}", e),
                })?;
        self.background_tasks.push(coordinator);

        self.start_api_server();
        self.start_background_tasks();

        info!("✅ Matchmaking service started successfully");
        Ok(())
    }

    /// Perform graceful shutdown
    pub async fn shutdown(&mut self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of {}", self.config.service.name);

        *self.is_running.write().await = false;

        self.api_server.stop();

        // Stops the coordinator and cancels in-flight allocations
        self.engine.shutdown();

        info!("Stopping metrics service...");
        if let Err(e) = self.metrics_service.stop().await {
            warn!("Failed to stop metrics service: {}", e);
        } else {
            info!("✅ Metrics service stopped");
        }

        self.stop_background_tasks().await;

        let final_stats = self
            .engine
            .get_stats()
            .map_err(|e| ServiceError::BackgroundTask {
                message: format!("Failed to get final stats: {}", e),
            })?;

        info!("Final service statistics: {:?}", final_stats);
        info!("✅ Matchmaking service shutdown completed");
        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub fn engine(&self) -> &MatchmakingEngine {
        &self.engine
    }

    pub fn metrics_service(&self) -> Arc<MetricsService> {
        self.metrics_service.clone()
    }

    fn initialize_metrics(
        config: &AppConfig,
        metrics_collector: Arc<MetricsCollector>,
        engine: &MatchmakingEngine,
    ) -> Arc<MetricsService> {
        info!(
            "Initializing metrics service on port {}",
            config.service.metrics_port
        );

        let health_config = HealthServerConfig {
            port: config.service.metrics_port,
            host: "0.0.0.0".to_string(),
            service_name: config.service.name.clone(),
        };

        let health_server = Arc::new(
            HealthServer::new(health_config, metrics_collector.clone()).with_engine(engine.clone()),
        );
        Arc::new(MetricsService::new(metrics_collector, health_server))
    }

    async fn start_metrics_service(&mut self) {
        info!("Starting metrics and health endpoints");

        let metrics_service = self.metrics_service.clone();
        let port = self.config.service.metrics_port;

        let metrics_handle = tokio::spawn(async move {
            if let Err(e) = metrics_service.start().await {
                error!("Metrics service failed: {:#}", e);
            } else {
                info!("Metrics service task completed");
            }
        });
        self.background_tasks.push(metrics_handle);

        // Give the server a moment to start up
        tokio::time::sleep(Duration::from_millis(100)).await;

        info!("✅ Metrics service started on port {}", port);
    }

    fn start_api_server(&mut self) {
        let api_server = self.api_server.clone();
        let port = self.config.service.http_port;

        let api_handle = tokio::spawn(async move {
            if let Err(e) = api_server.start().await {
                error!("API server failed: {:#}", e);
            }
        });
        self.background_tasks.push(api_handle);

        info!("✅ Matchmaking API started on port {}", port);
    }

    /// Periodically refresh gauges and component health
    fn start_background_tasks(&mut self) {
        info!(
            "Starting stats update task ({}s interval)...",
            STATS_INTERVAL.as_secs()
        );

        let engine = self.engine.clone();
        let metrics_collector = self.metrics_service.collector();
        let is_running = self.is_running.clone();
        let service_name = self.config.service.name.clone();

        let stats_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            let start_time = tokio::time::Instant::now();

            while *is_running.read().await {
                interval.tick().await;

                metrics_collector
                    .service()
                    .uptime_seconds
                    .set(start_time.elapsed().as_secs() as i64);

                match engine.get_stats() {
                    Ok(stats) => {
                        debug!(
                            "Updating metrics - waiting: {}, matches: {}, allocating: {}",
                            stats.players_waiting, stats.active_matches, stats.active_allocations
                        );
                        metrics_collector.update_from_engine_stats(&stats);
                    }
                    Err(e) => warn!("Failed to get engine stats for metrics update: {}", e),
                }

                match HealthCheck::check(&engine, &service_name) {
                    Ok(health) => {
                        metrics_collector.update_health_status(health.status.as_gauge());
                        for check in &health.checks {
                            metrics_collector.update_component_health(
                                &check.name,
                                check.status != HealthStatus::Unhealthy,
                            );
                        }
                    }
                    Err(e) => warn!("Health check failed: {}", e),
                }
            }

            info!("Stats update task stopped");
        });

        self.background_tasks.push(stats_task);
    }

    async fn stop_background_tasks(&mut self) {
        let task_count = self.background_tasks.len();
        if task_count == 0 {
            info!("No background tasks to stop");
            return;
        }

        info!("Stopping {} background tasks...", task_count);

        // Servers and the coordinator were signalled already; the stats task
        // may be parked on its interval and is simply aborted.
        let grace = self.config.shutdown_timeout().min(Duration::from_secs(1));
        for (i, mut task) in self.background_tasks.drain(..).enumerate() {
            match tokio::time::timeout(grace, &mut task).await {
                Ok(_) => debug!("Background task {}/{} finished", i + 1, task_count),
                Err(_) => {
                    debug!("Aborting background task {}/{}", i + 1, task_count);
                    task.abort();
                }
            }
        }

        info!("✅ All {} background tasks stopped", task_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = AppConfig::default();
        config.matchmaking.match_size = 0;

        let result = AppState::new(config).await;
        assert!(matches!(result, Err(ServiceError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_new_state_is_idle() {
        let mut state = AppState::new(AppConfig::default()).await.unwrap();

        assert!(!state.is_running().await);
        assert!(!state.engine().is_running());
        assert_eq!(state.engine().settings().match_size, 2);

        state.shutdown().await.unwrap();
    }
}
