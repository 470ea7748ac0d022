//! Utility functions for the matchmaking service

use crate::types::AllocationId;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Generate a new unique allocation ID
pub fn generate_allocation_id() -> AllocationId {
    Uuid::new_v4().to_string()
}

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Double a retry delay, never exceeding `cap`
pub fn next_backoff(delay: Duration, cap: Duration) -> Duration {
    (delay * 2).min(cap)
}
