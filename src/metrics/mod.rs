//! Metrics and monitoring for the green-room matchmaking service

pub mod collector;
pub mod health;

pub use collector::{
    MatchMetrics, MetricsCollector, MetricsTimer, ProviderMetrics, QueueMetrics, ServiceMetrics,
};
pub use health::{HealthServer, HealthServerConfig};

use std::sync::Arc;

/// Metrics collector plus the server exposing it
#[derive(Clone)]
pub struct MetricsService {
    collector: Arc<MetricsCollector>,
    health_server: Arc<HealthServer>,
}

impl MetricsService {
    pub fn new(collector: Arc<MetricsCollector>, health_server: Arc<HealthServer>) -> Self {
        Self {
            collector,
            health_server,
        }
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn health_server(&self) -> Arc<HealthServer> {
        self.health_server.clone()
    }

    /// Serve the health endpoints until stopped
    pub async fn start(&self) -> anyhow::Result<()> {
        self.health_server.start().await
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.health_server.stop().await
    }
}
