//! Green Room - matchmaking microservice that pairs players and allocates
//! game servers for them
//!
//! Players join over HTTP and wait in a FIFO queue. Every full batch of
//! players becomes a match, and the engine requests a game server for it
//! from the allocation provider, polling until the server's address is known.

pub mod config;
pub mod error;
pub mod matchmaking;
pub mod metrics;
pub mod service;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{MatchmakingError, Result};
pub use types::*;

// Re-export key components
pub use matchmaking::{
    AllocationProvider, EngineSettings, LoopbackAllocationProvider, MatchmakingEngine,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
