//! Health check endpoints and Prometheus metrics server
//!
//! Runs on its own port next to the player-facing API so that probes and
//! scrapes keep working while the API is under load.

use crate::matchmaking::MatchmakingEngine;
use crate::metrics::collector::MetricsCollector;
use crate::service::health::{HealthCheck, HealthStatus};
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Health server configuration
#[derive(Debug, Clone)]
pub struct HealthServerConfig {
    pub port: u16,
    /// Host to bind to (typically "0.0.0.0" for all interfaces)
    pub host: String,
    /// Name reported by health responses
    pub service_name: String,
}

impl Default for HealthServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            service_name: "green-room".to_string(),
        }
    }
}

/// Shared state for the health server
#[derive(Clone)]
pub struct HealthServerState {
    pub metrics_collector: Arc<MetricsCollector>,
    pub engine: Option<MatchmakingEngine>,
    pub service_name: String,
    pub started_at: DateTime<Utc>,
}

/// Health server that provides HTTP endpoints for monitoring
pub struct HealthServer {
    config: HealthServerConfig,
    state: HealthServerState,
    shutdown_tx: broadcast::Sender<()>,
}

impl HealthServer {
    pub fn new(config: HealthServerConfig, metrics_collector: Arc<MetricsCollector>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let service_name = config.service_name.clone();

        Self {
            config,
            state: HealthServerState {
                metrics_collector,
                engine: None,
                service_name,
                started_at: Utc::now(),
            },
            shutdown_tx,
        }
    }

    /// Set the engine whose health is reported
    pub fn with_engine(mut self, engine: MatchmakingEngine) -> Self {
        self.state.engine = Some(engine);
        self
    }

    /// Start the health server
    pub async fn start(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .context("Invalid health server address")?;

        let app = self.create_router();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind health server to {}", addr))?;

        info!("Health server listening on http://{}", addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Health server shutdown signal received");
            })
            .await?;

        info!("Health server stopped");
        Ok(())
    }

    pub(crate) fn create_router(&self) -> Router {
        Router::new()
            .route("/", get(root_handler))
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/alive", get(alive_handler))
            .route("/metrics", get(metrics_handler))
            .route("/stats", get(stats_handler))
            .with_state(self.state.clone())
    }

    /// Stop the health server
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping health server...");

        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Failed to send shutdown signal to health server: {}", e);
        }

        Ok(())
    }
}

async fn root_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    Json(json!({
        "service": state.service_name,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/health", "/ready", "/alive", "/metrics", "/stats"]
    }))
}

/// Lightweight health check endpoint handler
async fn health_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    debug!("Health check requested");

    let Some(engine) = &state.engine else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "service": state.service_name,
                "version": env!("CARGO_PKG_VERSION"),
                "error": "Service not initialized"
            })),
        );
    };

    let status = match HealthCheck::check(engine, &state.service_name) {
        Ok(health) => health.status,
        Err(e) => {
            error!("Health check failed: {}", e);
            HealthStatus::Unhealthy
        }
    };
    state.metrics_collector.update_health_status(status.as_gauge());

    let code = match status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };

    (
        code,
        Json(json!({
            "status": status,
            "service": state.service_name,
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

async fn ready_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    debug!("Readiness check requested");

    match &state.engine {
        Some(engine) => match HealthCheck::readiness_check(engine) {
            HealthStatus::Healthy => (StatusCode::OK, "Ready"),
            HealthStatus::Degraded => (StatusCode::OK, "Degraded but ready"),
            HealthStatus::Unhealthy => (StatusCode::SERVICE_UNAVAILABLE, "Not ready"),
        },
        None => (StatusCode::SERVICE_UNAVAILABLE, "Service not initialized"),
    }
}

async fn alive_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    debug!("Liveness check requested");

    match &state.engine {
        Some(engine) => match HealthCheck::liveness_check(engine) {
            HealthStatus::Healthy => (StatusCode::OK, "Alive"),
            _ => (StatusCode::SERVICE_UNAVAILABLE, "Not alive"),
        },
        None => (StatusCode::SERVICE_UNAVAILABLE, "Service not initialized"),
    }
}

/// Prometheus metrics endpoint handler
async fn metrics_handler(State(state): State<HealthServerState>) -> Response {
    debug!("Metrics endpoint requested");

    if let Some(engine) = &state.engine {
        match engine.get_stats() {
            Ok(stats) => state.metrics_collector.update_from_engine_stats(&stats),
            Err(e) => warn!("Failed to refresh engine gauges: {}", e),
        }
    }

    let metric_families = state.metrics_collector.registry().gather();
    let encoder = TextEncoder::new();

    match encoder.encode_to_string(&metric_families) {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", encoder.format_type().to_string())],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics".to_string(),
            )
                .into_response()
        }
    }
}

/// Detailed statistics for humans
async fn stats_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    debug!("Stats endpoint requested");

    let health = state
        .engine
        .as_ref()
        .map(|engine| HealthCheck::check(engine, &state.service_name));

    match health {
        Some(Ok(health)) => {
            let uptime = (Utc::now() - state.started_at).num_seconds();
            (
                StatusCode::OK,
                Json(json!({
                    "service": {
                        "name": state.service_name,
                        "version": env!("CARGO_PKG_VERSION"),
                        "status": health.status,
                        "uptime_seconds": uptime
                    },
                    "queue": {
                        "waiting": health.stats.players_waiting,
                        "joined": health.stats.players_joined
                    },
                    "matches": {
                        "active": health.stats.active_matches,
                        "allocating": health.stats.active_allocations,
                        "created": health.stats.matches_created,
                        "ended": health.stats.matches_ended,
                        "aborted": health.stats.matches_aborted,
                        "summary": health.stats.summary
                    },
                    "provider": {
                        "failures": health.stats.provider_failures
                    },
                    "components": health.checks,
                    "timestamp": Utc::now()
                })),
            )
        }
        Some(Err(e)) => {
            error!("Failed to get stats: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "service": { "name": state.service_name, "status": "error" },
                    "error": "Failed to get service stats",
                    "timestamp": Utc::now()
                })),
            )
        }
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "service": { "name": state.service_name, "status": "error" },
                "error": "Service not initialized",
                "timestamp": Utc::now()
            })),
        ),
    }
}
