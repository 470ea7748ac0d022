//! Main application configuration
//!
//! Settings come from a TOML file, from environment variables, or from the
//! defaults below. Command-line flags are applied on top by the binary.

use crate::error::MatchmakingError;
use crate::matchmaking::{EngineSettings, FleetSettings, PollSettings};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceSettings,
    pub provider: ProviderSettings,
    pub matchmaking: MatchmakingSettings,
}

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Service name for logging and metrics
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Port of the player-facing API
    pub http_port: u16,
    /// Port for health checks and metrics
    pub metrics_port: u16,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_seconds: u64,
}

/// Where allocations are requested, and the local server handed out by the
/// loopback provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub fleet_id: String,
    pub region_id: String,
    pub profile_id: i64,
    pub loopback_host: String,
    pub loopback_port: u16,
    /// Status queries before a loopback allocation reports its address
    pub loopback_ready_after_polls: u32,
}

/// Matchmaking-specific settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakingSettings {
    /// Players per match
    pub match_size: usize,
    /// Time between allocation status queries in milliseconds
    pub poll_interval_ms: u64,
    /// Give up on an allocation after this many seconds; 0 polls forever
    pub allocation_timeout_seconds: u64,
    /// Allocate retries after the first failed attempt
    pub allocate_max_retries: u32,
    /// Delay before the first allocate retry in milliseconds
    pub allocate_retry_delay_ms: u64,
    /// Pending match triggers buffered for the coordinator
    pub trigger_buffer: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: "green-room".to_string(),
            log_level: "info".to_string(),
            http_port: 10855,
            metrics_port: 8080,
            shutdown_timeout_seconds: 30,
        }
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            fleet_id: "local-fleet".to_string(),
            region_id: "local".to_string(),
            profile_id: 0,
            loopback_host: "127.0.0.1".to_string(),
            loopback_port: 7777,
            loopback_ready_after_polls: 1,
        }
    }
}

impl Default for MatchmakingSettings {
    fn default() -> Self {
        Self {
            match_size: 2,
            poll_interval_ms: 1000,
            allocation_timeout_seconds: 300,
            allocate_max_retries: 3,
            allocate_retry_delay_ms: 500,
            trigger_buffer: 64,
        }
    }
}

/// Parse an environment variable into `target` if it is set
fn env_override<T: std::str::FromStr>(name: &str, target: &mut T) -> Result<()> {
    if let Ok(value) = env::var(name) {
        *target = value
            .parse()
            .map_err(|_| anyhow!("Invalid {} value: {}", name, value))?;
    }
    Ok(())
}

impl AppConfig {
    /// Load configuration from environment variables with fallback to defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Load configuration from a TOML file. Environment variables still
    /// override what the file sets.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let mut config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_env()?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| {
            MatchmakingError::ConfigurationError {
                message: e.to_string(),
            }
            .into()
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        // Service settings
        if let Ok(name) = env::var("SERVICE_NAME") {
            self.service.name = name;
        }
        if let Ok(log_level) = env::var("LOG_LEVEL") {
            self.service.log_level = log_level;
        }
        env_override("HTTP_PORT", &mut self.service.http_port)?;
        env_override("METRICS_PORT", &mut self.service.metrics_port)?;
        env_override(
            "SHUTDOWN_TIMEOUT_SECONDS",
            &mut self.service.shutdown_timeout_seconds,
        )?;

        // Provider settings
        if let Ok(fleet_id) = env::var("MP_FLEET_ID") {
            self.provider.fleet_id = fleet_id;
        }
        if let Ok(region_id) = env::var("MP_REGION_ID") {
            self.provider.region_id = region_id;
        }
        env_override("MP_PROFILE_ID", &mut self.provider.profile_id)?;
        if let Ok(host) = env::var("LOOPBACK_HOST") {
            self.provider.loopback_host = host;
        }
        env_override("LOOPBACK_PORT", &mut self.provider.loopback_port)?;
        env_override(
            "LOOPBACK_READY_AFTER_POLLS",
            &mut self.provider.loopback_ready_after_polls,
        )?;

        // Matchmaking settings
        env_override("MATCH_SIZE", &mut self.matchmaking.match_size)?;
        env_override("POLL_INTERVAL_MS", &mut self.matchmaking.poll_interval_ms)?;
        env_override(
            "ALLOCATION_TIMEOUT_SECONDS",
            &mut self.matchmaking.allocation_timeout_seconds,
        )?;
        env_override(
            "ALLOCATE_MAX_RETRIES",
            &mut self.matchmaking.allocate_max_retries,
        )?;
        env_override(
            "ALLOCATE_RETRY_DELAY_MS",
            &mut self.matchmaking.allocate_retry_delay_ms,
        )?;
        env_override("TRIGGER_BUFFER", &mut self.matchmaking.trigger_buffer)?;

        Ok(())
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.service.shutdown_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.matchmaking.poll_interval_ms)
    }

    /// Overall allocation deadline; `None` when disabled
    pub fn allocation_timeout(&self) -> Option<Duration> {
        match self.matchmaking.allocation_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn allocate_retry_delay(&self) -> Duration {
        Duration::from_millis(self.matchmaking.allocate_retry_delay_ms)
    }

    /// Engine tunables derived from this configuration
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            match_size: self.matchmaking.match_size,
            fleet: FleetSettings {
                fleet_id: self.provider.fleet_id.clone(),
                region_id: self.provider.region_id.clone(),
                profile_id: self.provider.profile_id,
            },
            poll: PollSettings {
                interval: self.poll_interval(),
                deadline: self.allocation_timeout(),
            },
            allocate_max_retries: self.matchmaking.allocate_max_retries,
            allocate_retry_delay: self.allocate_retry_delay(),
            trigger_buffer: self.matchmaking.trigger_buffer,
        }
    }
}

/// Validate configuration values
pub fn validate_config(config: &AppConfig) -> Result<()> {
    match config.service.log_level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        _ => return Err(anyhow!("Invalid log level: {}", config.service.log_level)),
    }

    if config.service.http_port == 0 {
        return Err(anyhow!("HTTP port cannot be 0"));
    }
    if config.service.metrics_port == 0 {
        return Err(anyhow!("Metrics port cannot be 0"));
    }
    if config.service.http_port == config.service.metrics_port {
        return Err(anyhow!(
            "HTTP and metrics ports must differ (both {})",
            config.service.http_port
        ));
    }
    if config.service.shutdown_timeout_seconds == 0 {
        return Err(anyhow!("Shutdown timeout must be greater than 0"));
    }

    if config.provider.fleet_id.is_empty() {
        return Err(anyhow!("Fleet id cannot be empty"));
    }
    if config.provider.loopback_port == 0 {
        return Err(anyhow!("Loopback port cannot be 0"));
    }

    if config.matchmaking.match_size == 0 {
        return Err(anyhow!("Match size must be greater than 0"));
    }
    if config.matchmaking.poll_interval_ms == 0 {
        return Err(anyhow!("Poll interval must be greater than 0"));
    }
    if config.matchmaking.trigger_buffer == 0 {
        return Err(anyhow!("Trigger buffer must be greater than 0"));
    }

    Ok(())
}
