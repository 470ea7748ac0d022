//! Metrics collection using Prometheus
//!
//! All metrics live in one registry owned by [`MetricsCollector`] and are
//! exposed by the health server under `/metrics`.

use crate::matchmaking::EngineStats;
use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the matchmaking service
#[derive(Clone)]
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// Service-level metrics
    service_metrics: ServiceMetrics,

    /// Queue and join metrics
    queue_metrics: QueueMetrics,

    /// Match and allocation metrics
    match_metrics: MatchMetrics,

    /// Allocation provider call metrics
    provider_metrics: ProviderMetrics,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    /// Component health status
    pub component_health: IntGaugeVec,
}

#[derive(Clone)]
pub struct QueueMetrics {
    /// Distinct players that entered the queue
    pub players_joined_total: IntCounter,

    /// Players currently waiting in the queue
    pub players_waiting: IntGauge,

    /// Time spent handling a join
    pub join_duration: Histogram,
}

#[derive(Clone)]
pub struct MatchMetrics {
    pub matches_created_total: IntCounter,

    pub matches_ended_total: IntCounter,

    /// Current number of match records
    pub active_matches: IntGauge,

    /// Settled allocations by outcome (resolved, gone, timed_out, rolled_back)
    pub allocation_outcomes_total: IntCounterVec,

    /// Allocation tasks still requesting or polling
    pub active_allocations: IntGauge,

    /// Time from allocation request until the server address was known
    pub time_to_ready_seconds: Histogram,

    /// Players per formed match
    pub match_players: Histogram,
}

#[derive(Clone)]
pub struct ProviderMetrics {
    /// Provider calls by operation and status
    pub calls_total: IntCounterVec,

    /// Failed provider calls by operation
    pub errors_total: IntCounterVec,

    /// Provider failures since the last successful call
    pub consecutive_failures: IntGauge,

    pub call_duration: HistogramVec,
}

impl MetricsCollector {
    /// Create a new metrics collector with default registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let service_metrics = ServiceMetrics::new(&registry)?;
        let queue_metrics = QueueMetrics::new(&registry)?;
        let match_metrics = MatchMetrics::new(&registry)?;
        let provider_metrics = ProviderMetrics::new(&registry)?;

        Ok(Self {
            registry,
            service_metrics,
            queue_metrics,
            match_metrics,
            provider_metrics,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    pub fn queue(&self) -> &QueueMetrics {
        &self.queue_metrics
    }

    pub fn matches(&self) -> &MatchMetrics {
        &self.match_metrics
    }

    pub fn provider(&self) -> &ProviderMetrics {
        &self.provider_metrics
    }

    /// Refresh the point-in-time gauges from engine stats. Counters are
    /// recorded as events happen and are left alone here.
    pub fn update_from_engine_stats(&self, stats: &EngineStats) {
        self.queue_metrics
            .players_waiting
            .set(stats.players_waiting as i64);
        self.match_metrics
            .active_matches
            .set(stats.active_matches as i64);
        self.match_metrics
            .active_allocations
            .set(stats.active_allocations as i64);
        self.provider_metrics
            .consecutive_failures
            .set(stats.consecutive_provider_failures as i64);
    }

    /// Record a new player entering the queue
    pub fn record_player_joined(&self) {
        self.queue_metrics.players_joined_total.inc();
    }

    pub fn record_join_duration(&self, duration: Duration) {
        self.queue_metrics
            .join_duration
            .observe(duration.as_secs_f64());
    }

    /// Record a match being formed out of `players` queued players
    pub fn record_match_created(&self, players: usize) {
        self.match_metrics.matches_created_total.inc();
        self.match_metrics.match_players.observe(players as f64);
    }

    pub fn record_match_ended(&self) {
        self.match_metrics.matches_ended_total.inc();
    }

    /// Record how an allocation settled
    pub fn record_allocation_outcome(&self, outcome: &str) {
        self.match_metrics
            .allocation_outcomes_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Record the time an allocation took to become reachable
    pub fn record_allocation_ready(&self, elapsed: Duration) {
        self.match_metrics
            .time_to_ready_seconds
            .observe(elapsed.as_secs_f64());
    }

    /// Record a call to the allocation provider
    pub fn record_provider_call(&self, operation: &str, success: bool, duration: Duration) {
        let status = if success { "success" } else { "error" };

        self.provider_metrics
            .calls_total
            .with_label_values(&[operation, status])
            .inc();

        if !success {
            self.provider_metrics
                .errors_total
                .with_label_values(&[operation])
                .inc();
        }

        self.provider_metrics
            .call_duration
            .with_label_values(&[operation, status])
            .observe(duration.as_secs_f64());
    }

    /// Update health status
    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    /// Update component health
    pub fn update_component_health(&self, component: &str, healthy: bool) {
        let status = if healthy { 1 } else { 0 };
        self.service_metrics
            .component_health
            .with_label_values(&[component])
            .set(status);
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get the elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds =
            IntGauge::new("green_room_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let health_status = IntGauge::new(
            "green_room_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("green_room_component_health", "Component health status"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            uptime_seconds,
            health_status,
            component_health,
        })
    }
}

impl QueueMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let players_joined_total = IntCounter::new(
            "green_room_players_joined_total",
            "Distinct players that entered the queue",
        )?;
        registry.register(Box::new(players_joined_total.clone()))?;

        let players_waiting = IntGauge::new(
            "green_room_players_waiting",
            "Players currently waiting in the queue",
        )?;
        registry.register(Box::new(players_waiting.clone()))?;

        let join_duration = Histogram::with_opts(
            HistogramOpts::new(
                "green_room_join_duration_seconds",
                "Join request handling time",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1]),
        )?;
        registry.register(Box::new(join_duration.clone()))?;

        Ok(Self {
            players_joined_total,
            players_waiting,
            join_duration,
        })
    }
}

impl MatchMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let matches_created_total =
            IntCounter::new("green_room_matches_created_total", "Total matches formed")?;
        registry.register(Box::new(matches_created_total.clone()))?;

        let matches_ended_total =
            IntCounter::new("green_room_matches_ended_total", "Total matches ended")?;
        registry.register(Box::new(matches_ended_total.clone()))?;

        let active_matches =
            IntGauge::new("green_room_active_matches", "Current number of matches")?;
        registry.register(Box::new(active_matches.clone()))?;

        let allocation_outcomes_total = IntCounterVec::new(
            Opts::new(
                "green_room_allocation_outcomes_total",
                "Settled allocations by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(allocation_outcomes_total.clone()))?;

        let active_allocations = IntGauge::new(
            "green_room_active_allocations",
            "Allocation tasks still requesting or polling",
        )?;
        registry.register(Box::new(active_allocations.clone()))?;

        let time_to_ready_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "green_room_time_to_ready_seconds",
                "Time until an allocated server address was known",
            )
            .buckets(vec![1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0]),
        )?;
        registry.register(Box::new(time_to_ready_seconds.clone()))?;

        let match_players = Histogram::with_opts(
            HistogramOpts::new("green_room_match_players", "Players per formed match")
                .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0]),
        )?;
        registry.register(Box::new(match_players.clone()))?;

        Ok(Self {
            matches_created_total,
            matches_ended_total,
            active_matches,
            allocation_outcomes_total,
            active_allocations,
            time_to_ready_seconds,
            match_players,
        })
    }
}

impl ProviderMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let calls_total = IntCounterVec::new(
            Opts::new(
                "green_room_provider_calls_total",
                "Allocation provider calls",
            ),
            &["operation", "status"],
        )?;
        registry.register(Box::new(calls_total.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new(
                "green_room_provider_errors_total",
                "Failed allocation provider calls",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let consecutive_failures = IntGauge::new(
            "green_room_provider_consecutive_failures",
            "Provider failures since the last successful call",
        )?;
        registry.register(Box::new(consecutive_failures.clone()))?;

        let call_duration = HistogramVec::new(
            HistogramOpts::new(
                "green_room_provider_call_duration_seconds",
                "Allocation provider call duration",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["operation", "status"],
        )?;
        registry.register(Box::new(call_duration.clone()))?;

        Ok(Self {
            calls_total,
            errors_total,
            consecutive_failures,
            call_duration,
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics collector")
    }
}
