//! Health checks for the matchmaking service
//!
//! Health is derived from the engine: whether the coordinator consumes
//! triggers, whether the shared state is internally consistent and how the
//! allocation provider has been answering lately.

use crate::matchmaking::MatchmakingEngine;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Consecutive provider failures after which the provider counts as down
pub const PROVIDER_FAILURE_THRESHOLD: u32 = 10;

/// Health check status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Gauge value exported as `green_room_health_status`
    pub fn as_gauge(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 2,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 0,
        }
    }

    fn worst(self, other: &HealthStatus) -> HealthStatus {
        match (&self, other) {
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => {
                HealthStatus::Unhealthy
            }
            (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "✅ healthy"),
            HealthStatus::Degraded => write!(f, "⚠️  degraded"),
            HealthStatus::Unhealthy => write!(f, "❌ unhealthy"),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Overall service status
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Detailed component checks
    pub checks: Vec<ComponentCheck>,
    pub stats: ServiceStats,
}

/// Individual component health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: HealthStatus,
    /// Optional error message if not healthy
    pub message: Option<String>,
    /// Check duration in milliseconds
    pub duration_ms: u64,
}

/// Service statistics for health reporting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    pub players_waiting: usize,
    pub active_matches: usize,
    pub active_allocations: usize,
    pub players_joined: u64,
    pub matches_created: u64,
    pub matches_ended: u64,
    pub matches_aborted: u64,
    pub provider_failures: u64,
    pub summary: String,
}

impl HealthCheck {
    /// Perform a comprehensive health check of the service
    pub fn check(engine: &MatchmakingEngine, service: &str) -> Result<Self> {
        let checks = vec![
            Self::check_coordinator(engine),
            Self::check_match_state(engine),
            Self::check_provider(engine),
        ];

        let status = checks
            .iter()
            .fold(HealthStatus::Healthy, |acc, check| acc.worst(&check.status));

        Ok(HealthCheck {
            status,
            service: service.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now(),
            checks,
            stats: Self::gather_service_stats(engine),
        })
    }

    /// Simple liveness check - the coordinator is still consuming triggers
    pub fn liveness_check(engine: &MatchmakingEngine) -> HealthStatus {
        if engine.is_running() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    /// Readiness check - verify the service can handle joins
    pub fn readiness_check(engine: &MatchmakingEngine) -> HealthStatus {
        if !engine.is_running() {
            return HealthStatus::Unhealthy;
        }

        Self::check_match_state(engine).status
    }

    fn check_coordinator(engine: &MatchmakingEngine) -> ComponentCheck {
        let start = std::time::Instant::now();

        let (status, message) = if engine.is_running() {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Unhealthy,
                Some("Matchmaking coordinator is not running".to_string()),
            )
        };

        ComponentCheck {
            name: "coordinator".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn check_match_state(engine: &MatchmakingEngine) -> ComponentCheck {
        let start = std::time::Instant::now();

        let (status, message) = match engine.state().integrity_violations() {
            Ok(violations) if violations.is_empty() => (HealthStatus::Healthy, None),
            Ok(violations) => (
                HealthStatus::Degraded,
                Some(format!(
                    "{} integrity violations, first: {}",
                    violations.len(),
                    violations[0]
                )),
            ),
            Err(e) => {
                error!("Match state check failed: {}", e);
                (
                    HealthStatus::Unhealthy,
                    Some(format!("Cannot access match state: {}", e)),
                )
            }
        };

        ComponentCheck {
            name: "match_state".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn check_provider(engine: &MatchmakingEngine) -> ComponentCheck {
        let start = std::time::Instant::now();

        let (status, message) = match engine.get_stats() {
            Ok(stats) => match stats.consecutive_provider_failures {
                0 => (HealthStatus::Healthy, None),
                n if n < PROVIDER_FAILURE_THRESHOLD => (
                    HealthStatus::Degraded,
                    Some(format!("{} consecutive provider failures", n)),
                ),
                n => (
                    HealthStatus::Unhealthy,
                    Some(format!("Provider unavailable: {} consecutive failures", n)),
                ),
            },
            Err(e) => (
                HealthStatus::Degraded,
                Some(format!("Stats check failed: {}", e)),
            ),
        };

        ComponentCheck {
            name: "allocation_provider".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn gather_service_stats(engine: &MatchmakingEngine) -> ServiceStats {
        match engine.get_stats() {
            Ok(stats) => ServiceStats {
                players_waiting: stats.players_waiting,
                active_matches: stats.active_matches,
                active_allocations: stats.active_allocations,
                players_joined: stats.players_joined,
                matches_created: stats.matches_created,
                matches_ended: stats.matches_ended,
                matches_aborted: stats.matches_aborted,
                provider_failures: stats.provider_failures,
                summary: format!(
                    "Matches resolved: {}, rolled back: {}",
                    stats.matches_resolved, stats.matches_rolled_back
                ),
            },
            Err(e) => {
                debug!("Failed to get engine stats for health check: {}", e);
                ServiceStats::default()
            }
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize health check: {}", e))
    }
}
