//! Service layer for the green-room matchmaking service
//!
//! The player API, health checks, and the application state that wires the
//! engine, servers and background tasks together.

pub mod api;
pub mod app;
pub mod health;

pub use api::{router, ApiServer, ApiServerConfig};
pub use app::{AppState, ServiceError};
pub use health::{HealthCheck, HealthStatus};
