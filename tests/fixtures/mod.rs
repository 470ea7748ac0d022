//! Test fixtures and a scripted allocation provider for integration testing

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use green_room::error::Result;
use green_room::matchmaking::{
    AllocationProvider, AllocationReceipt, AllocationStatus, EngineSettings, FleetSettings,
    MatchmakingEngine, PollSettings,
};
use green_room::types::{JoinRequest, MatchInfo};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A provider call as seen by [`ScriptedAllocationProvider`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    Allocate {
        fleet_id: String,
        region_id: String,
        profile_id: i64,
        allocation_id: String,
    },
    Poll {
        allocation_id: String,
    },
    Deallocate {
        fleet_id: String,
        allocation_id: String,
    },
}

/// What a single status query answers
#[derive(Debug, Clone)]
pub enum PollStep {
    Pending,
    Fail,
    Gone,
    Ready(String, u16),
}

/// Allocation provider that records every call and answers status queries
/// from a script shared by all allocations. Each allocation walks the script
/// on its own; the last step repeats once the script is used up.
#[derive(Debug)]
pub struct ScriptedAllocationProvider {
    calls: Mutex<Vec<ProviderCall>>,
    script: Vec<PollStep>,
    progress: Mutex<HashMap<String, VecDeque<PollStep>>>,
    fail_allocate: Mutex<bool>,
    fail_deallocate: Mutex<bool>,
    allocate_delay: Duration,
}

impl ScriptedAllocationProvider {
    pub fn new(script: Vec<PollStep>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            script,
            progress: Mutex::new(HashMap::new()),
            fail_allocate: Mutex::new(false),
            fail_deallocate: Mutex::new(false),
            allocate_delay: Duration::ZERO,
        }
    }

    /// Every allocation becomes ready after one pending answer
    pub fn ready_after_one_poll(host: &str, port: u16) -> Self {
        Self::new(vec![PollStep::Pending, PollStep::Ready(host.to_string(), port)])
    }

    /// Allocations never settle
    pub fn always_pending() -> Self {
        Self::new(vec![PollStep::Pending])
    }

    pub fn with_allocate_delay(mut self, delay: Duration) -> Self {
        self.allocate_delay = delay;
        self
    }

    pub fn set_fail_allocate(&self, fail: bool) {
        *self.fail_allocate.lock().unwrap() = fail;
    }

    pub fn set_fail_deallocate(&self, fail: bool) {
        *self.fail_deallocate.lock().unwrap() = fail;
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Allocation ids passed to `allocate`, in call order
    pub fn allocated_ids(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ProviderCall::Allocate { allocation_id, .. } => Some(allocation_id),
                _ => None,
            })
            .collect()
    }

    pub fn deallocated_ids(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ProviderCall::Deallocate { allocation_id, .. } => Some(allocation_id),
                _ => None,
            })
            .collect()
    }

    pub fn poll_count(&self, allocation_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, ProviderCall::Poll { allocation_id: id } if id == allocation_id))
            .count()
    }

    fn record(&self, call: ProviderCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl AllocationProvider for ScriptedAllocationProvider {
    async fn allocate(
        &self,
        fleet_id: &str,
        region_id: &str,
        profile_id: i64,
        allocation_id: &str,
    ) -> Result<AllocationReceipt> {
        self.record(ProviderCall::Allocate {
            fleet_id: fleet_id.to_string(),
            region_id: region_id.to_string(),
            profile_id,
            allocation_id: allocation_id.to_string(),
        });

        if !self.allocate_delay.is_zero() {
            tokio::time::sleep(self.allocate_delay).await;
        }

        if *self.fail_allocate.lock().unwrap() {
            return Err(anyhow::anyhow!("allocate rejected with 500"));
        }

        self.progress
            .lock()
            .unwrap()
            .insert(allocation_id.to_string(), self.script.iter().cloned().collect());

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
        self.record(ProviderCall::Poll {
            allocation_id: allocation_id.to_string(),
        });

        let step = {
            let mut progress = self.progress.lock().unwrap();
            let Some(steps) = progress.get_mut(allocation_id) else {
                return Ok(Vec::new());
            };
            if steps.len() > 1 {
                steps.pop_front()
            } else {
                steps.front().cloned()
            }
        };

        match step {
            Some(PollStep::Pending) => Ok(vec![AllocationStatus::pending()]),
            Some(PollStep::Fail) => Err(anyhow::anyhow!("poll timed out")),
            Some(PollStep::Ready(host, port)) => Ok(vec![AllocationStatus::ready(host, port)]),
            Some(PollStep::Gone) | None => Ok(Vec::new()),
        }
    }

    async fn deallocate(&self, fleet_id: &str, allocation_id: &str) -> Result<()> {
        self.record(ProviderCall::Deallocate {
            fleet_id: fleet_id.to_string(),
            allocation_id: allocation_id.to_string(),
        });

        if *self.fail_deallocate.lock().unwrap() {
            return Err(anyhow::anyhow!("deallocate rejected with 503"));
        }

        self.progress.lock().unwrap().remove(allocation_id);
        Ok(())
    }
}

/// Engine settings with short intervals suitable for tests
pub fn fast_settings(match_size: usize) -> EngineSettings {
    EngineSettings {
        match_size,
        fleet: FleetSettings {
            fleet_id: "test-fleet".to_string(),
            region_id: "test-region".to_string(),
            profile_id: 99,
        },
        poll: PollSettings {
            interval: Duration::from_millis(10),
            deadline: Some(Duration::from_secs(5)),
        },
        allocate_max_retries: 2,
        allocate_retry_delay: Duration::from_millis(5),
        trigger_buffer: 16,
    }
}

/// Engine with a started coordinator around `provider`
pub fn running_engine(
    provider: Arc<ScriptedAllocationProvider>,
    settings: EngineSettings,
) -> MatchmakingEngine {
    let engine = MatchmakingEngine::new(provider, settings);
    engine.start().expect("coordinator starts");
    engine
}

pub fn join(engine: &MatchmakingEngine, player_id: &str) -> MatchInfo {
    engine
        .join(JoinRequest {
            player_id: player_id.to_string(),
            source_address: Some(format!("198.51.100.7:{}", 40000 + player_id.len())),
        })
        .expect("join succeeds")
}

/// Poll `condition` every 10ms for up to five seconds
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
