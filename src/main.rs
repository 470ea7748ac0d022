//! Main entry point for the Green Room matchmaking service
//!
//! Loads configuration, starts the matchmaking engine with its HTTP servers
//! and runs until SIGINT or SIGTERM.

use anyhow::Result;
use clap::Parser;
use green_room::config::{validate_config, AppConfig};
use green_room::service::{AppState, HealthCheck};
use green_room::MatchmakingEngine;
use std::path::PathBuf;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// Green Room Matchmaking Service
#[derive(Parser)]
#[command(
    name = "green-room",
    version,
    about = "A matchmaking microservice that pairs players and allocates game servers",
    long_about = "Green Room queues players joining over HTTP, groups them first come first \
                 served into matches of a fixed size, and requests a game server for every \
                 match from the allocation provider until its address is known."
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Path to configuration file (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Log level override
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Override log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    #[arg(long, value_name = "PORT", help = "Override player API port")]
    http_port: Option<u16>,

    #[arg(long, value_name = "PORT", help = "Override metrics server port")]
    metrics_port: Option<u16>,

    #[arg(long, value_name = "N", help = "Override the number of players per match")]
    match_size: Option<usize>,

    /// Enable debug mode
    #[arg(short, long, help = "Enable debug mode with verbose logging")]
    debug: bool,

    /// Dry run mode (validate config and exit)
    #[arg(
        long,
        help = "Validate configuration and exit without starting service"
    )]
    dry_run: bool,
}

/// Initialize structured logging with the configured level
fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Wait for shutdown signals (SIGINT, SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C) signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

/// Log a health summary every 30 seconds
async fn health_check_task(engine: MatchmakingEngine, service_name: String) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));

    loop {
        interval.tick().await;

        match HealthCheck::check(&engine, &service_name) {
            Ok(health) => {
                info!(
                    "Health check: {} - {} waiting, {} matches, {} allocating",
                    health.status,
                    health.stats.players_waiting,
                    health.stats.active_matches,
                    health.stats.active_allocations
                );
            }
            Err(e) => {
                warn!("Health check failed: {}", e);
            }
        }
    }
}

/// Display startup banner with service information
fn display_startup_banner(config: &AppConfig) {
    info!("🚀 Green Room Matchmaking Service");
    info!("   Service: {}", config.service.name);
    info!("   Log level: {}", config.service.log_level);
    info!("   API port: {}", config.service.http_port);
    info!("   Metrics port: {}", config.service.metrics_port);
    info!(
        "   Fleet: {} (region {}, profile {})",
        config.provider.fleet_id, config.provider.region_id, config.provider.profile_id
    );
    info!(
        "   Loopback server: {}:{}",
        config.provider.loopback_host, config.provider.loopback_port
    );
    info!("   Match size: {}", config.matchmaking.match_size);
    info!(
        "   Poll interval: {}ms, allocation timeout: {}s",
        config.matchmaking.poll_interval_ms, config.matchmaking.allocation_timeout_seconds
    );
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}

/// Load configuration from file or environment and apply CLI overrides
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = if let Some(config_path) = &args.config {
        AppConfig::from_file(config_path)?
    } else {
        AppConfig::from_env()?
    };

    if let Some(log_level) = &args.log_level {
        config.service.log_level = log_level.clone();
    }

    if args.debug {
        config.service.log_level = "debug".to_string();
    }

    if let Some(http_port) = args.http_port {
        config.service.http_port = http_port;
    }

    if let Some(metrics_port) = args.metrics_port {
        config.service.metrics_port = metrics_port;
    }

    if let Some(match_size) = args.match_size {
        config.matchmaking.match_size = match_size;
    }

    validate_config(&config)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args).unwrap_or_else(|e| {
        eprintln!("Configuration error: {:#}", e);
        std::process::exit(1);
    });

    // Initialize logging early (before any other operations)
    if let Err(e) = init_logging(&config.service.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    if let Some(config_path) = &args.config {
        info!("Loaded configuration from: {}", config_path.display());
    }

    if args.dry_run {
        info!("Configuration validation successful");
        display_startup_banner(&config);
        info!("Dry run completed - exiting without starting service");
        return Ok(());
    }

    display_startup_banner(&config);

    info!("Initializing service components...");
    let mut app_state = match AppState::new(config.clone()).await {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to initialize application: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting service...");
    if let Err(e) = app_state.start().await {
        error!("Failed to start service: {}", e);
        std::process::exit(1);
    }

    let health_task = tokio::spawn(health_check_task(
        app_state.engine().clone(),
        config.service.name.clone(),
    ));

    info!("✅ Green Room Matchmaking Service is running");
    info!("Press Ctrl+C to shutdown gracefully...");

    wait_for_shutdown_signal().await;

    info!("🛑 Shutdown signal received, beginning graceful shutdown...");
    health_task.abort();

    match tokio::time::timeout(config.shutdown_timeout(), app_state.shutdown()).await {
        Ok(Ok(())) => info!("✅ Graceful shutdown completed successfully"),
        Ok(Err(e)) => warn!("Shutdown finished with an error: {}", e),
        Err(_) => warn!("⚠️  Shutdown timeout exceeded, forcing exit"),
    }

    info!("🛑 Green Room Matchmaking Service stopped");
    Ok(())
}
