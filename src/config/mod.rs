//! Configuration management for the green-room service
//!
//! Loading from TOML files and environment variables, validation, and
//! default values for the matchmaking service.

pub mod app;

pub use app::{validate_config, AppConfig, MatchmakingSettings, ProviderSettings, ServiceSettings};
