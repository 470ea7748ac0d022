//! Allocation provider interface and the loopback implementation
//!
//! The provider is the external service that grants and reclaims game-server
//! allocations. The engine only needs the three calls on
//! [`AllocationProvider`]; transport and request signing live behind it.

use crate::error::{MatchmakingError, Result};
use crate::types::{AllocationId, ServerAddress};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

/// Fleet, region and profile the allocations are requested against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetSettings {
    pub fleet_id: String,
    pub region_id: String,
    pub profile_id: i64,
}

/// Acknowledgement of an allocation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationReceipt {
    pub allocation_id: AllocationId,
    pub profile_id: i64,
    pub region_id: String,
    pub created: DateTime<Utc>,
}

/// One entry of an allocation status query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationStatus {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub game_port: Option<u16>,
}

impl AllocationStatus {
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn ready(ip: impl Into<String>, game_port: u16) -> Self {
        Self {
            ip: Some(ip.into()),
            game_port: Some(game_port),
        }
    }

    /// The server address, once the provider has filled it in
    pub fn address(&self) -> Option<ServerAddress> {
        match (self.ip.as_deref(), self.game_port) {
            (Some(ip), Some(port)) if !ip.is_empty() => Some(ServerAddress {
                host: ip.to_string(),
                port,
            }),
            _ => None,
        }
    }
}

/// Calls the matchmaker makes on the allocation provider
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AllocationProvider: Send + Sync {
    /// Request a server for `allocation_id`
    async fn allocate(
        &self,
        fleet_id: &str,
        region_id: &str,
        profile_id: i64,
        allocation_id: &str,
    ) -> Result<AllocationReceipt>;

    /// Current status of `allocation_id`. An empty list means the provider no
    /// longer knows the allocation.
    async fn poll_allocations(
        &self,
        fleet_id: &str,
        region_id: &str,
        profile_id: i64,
        allocation_id: &str,
    ) -> Result<Vec<AllocationStatus>>;

    /// Release the server held by `allocation_id`
    async fn deallocate(&self, fleet_id: &str, allocation_id: &str) -> Result<()>;
}

/// Provider that hands out one fixed local game server.
///
/// Every allocation becomes ready after `ready_after_polls` status queries and
/// reports `host:port`. Useful for running the service against a locally
/// started game server.
#[derive(Debug)]
pub struct LoopbackAllocationProvider {
    host: String,
    port: u16,
    ready_after_polls: u32,
    /// Poll count per live allocation
    allocations: Mutex<HashMap<AllocationId, u32>>,
}

impl LoopbackAllocationProvider {
    pub fn new(host: impl Into<String>, port: u16, ready_after_polls: u32) -> Self {
        Self {
            host: host.into(),
            port,
            ready_after_polls,
            allocations: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for LoopbackAllocationProvider {
    fn default() -> Self {
        Self::new("127.0.0.1", 7777, 1)
    }
}

#[async_trait]
impl AllocationProvider for LoopbackAllocationProvider {
    async fn allocate(
        &self,
        fleet_id: &str,
        region_id: &str,
        profile_id: i64,
        allocation_id: &str,
    ) -> Result<AllocationReceipt> {
        info!(
            "Loopback allocate - fleet: {}, region: {}, profile: {}, allocation: {}",
            fleet_id, region_id, profile_id, allocation_id
        );

        let mut allocations = self
            .allocations
            .lock()
            .map_err(|_| MatchmakingError::lock_poisoned("loopback allocations"))?;
        allocations.insert(allocation_id.to_string(), 0);

        Ok(AllocationReceipt {
            allocation_id: allocation_id.to_string(),
            profile_id,
            region_id: region_id.to_string(),
            created: Utc::now(),
        })
    }

    async fn poll_allocations(
        &self,
        _fleet_id: &str,
        _region_id: &str,
        _profile_id: i64,
        allocation_id: &str,
    ) -> Result<Vec<AllocationStatus>> {
        let mut allocations = self
            .allocations
            .lock()
            .map_err(|_| MatchmakingError::lock_poisoned("loopback allocations"))?;

        let Some(polls) = allocations.get_mut(allocation_id) else {
            return Ok(Vec::new());
        };
        *polls += 1;
        debug!("Loopback poll {} for allocation {}", polls, allocation_id);

        if *polls >= self.ready_after_polls {
            Ok(vec![AllocationStatus::ready(self.host.clone(), self.port)])
        } else {
            Ok(vec![AllocationStatus::pending()])
        }
    }

    async fn deallocate(&self, fleet_id: &str, allocation_id: &str) -> Result<()> {
        info!(
            "Loopback deallocate - fleet: {}, allocation: {}",
            fleet_id, allocation_id
        );
        let mut allocations = self
            .allocations
            .lock()
            .map_err(|_| MatchmakingError::lock_poisoned("loopback allocations"))?;
        allocations.remove(allocation_id);
        Ok(())
    }
}
