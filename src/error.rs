//! Error types for the matchmaking service
//!
//! Fallible functions return `anyhow::Result`; errors whose kind matters to a
//! caller (the HTTP layer, tests) are raised as [`MatchmakingError`] and can be
//! recovered with `downcast_ref`.

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Custom error types for specific matchmaking scenarios
#[derive(Debug, thiserror::Error)]
pub enum MatchmakingError {
    #[error("Bad request: {reason}")]
    BadRequest { reason: String },

    #[error("Player not found: {player_id}")]
    PlayerNotFound { player_id: String },

    #[error("Unknown match: {allocation_id}")]
    UnknownMatch { allocation_id: String },

    #[error("Player {player_id} is assigned to missing match {allocation_id}")]
    IntegrityError {
        player_id: String,
        allocation_id: String,
    },

    #[error("Allocation provider unavailable during {operation}: {message}")]
    ProviderUnavailable { operation: String, message: String },

    #[error("Allocation gone: {allocation_id}")]
    AllocationGone { allocation_id: String },

    #[error("Failed to deallocate {allocation_id}: {message}")]
    DeallocationFailed {
        allocation_id: String,
        message: String,
    },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Internal service error: {message}")]
    InternalError { message: String },
}

impl MatchmakingError {
    /// Build the error returned when a shared lock has been poisoned
    pub fn lock_poisoned(what: &str) -> Self {
        MatchmakingError::InternalError {
            message: format!("Failed to acquire {} lock", what),
        }
    }
}

/// Extract the [`MatchmakingError`] carried by an `anyhow::Error`, if any
pub fn as_matchmaking_error(error: &anyhow::Error) -> Option<&MatchmakingError> {
    error.downcast_ref::<MatchmakingError>()
}
