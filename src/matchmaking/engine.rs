//! Matchmaking engine
//!
//! The engine turns queued players into allocated, reachable matches. Joins
//! register the player and send a trigger to a single coordinator task, which
//! drains the queue into as many full matches as it can. Every new match gets
//! its own allocation task that requests a server, polls until it settles and
//! writes the result back into the shared [`MatchState`]. Allocation tasks
//! are keyed by allocation id so that ending a match can cancel its task.

use crate::error::{MatchmakingError, Result};
use crate::matchmaking::lifecycle::{AllocationPoller, PollOutcome, PollReport, PollSettings};
use crate::matchmaking::provider::{AllocationProvider, AllocationReceipt, FleetSettings};
use crate::matchmaking::state::{MatchState, Registration};
use crate::metrics::MetricsCollector;
use crate::types::{AllocationId, JoinRequest, MatchInfo, PlayerInfo};
use crate::utils::next_backoff;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const MAX_ALLOCATE_BACKOFF: Duration = Duration::from_secs(5);

/// Tunables of the matchmaking engine
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Players per match
    pub match_size: usize,
    /// Where allocations are requested
    pub fleet: FleetSettings,
    /// Poll loop interval and deadline
    pub poll: PollSettings,
    /// Extra allocate attempts after the first one fails
    pub allocate_max_retries: u32,
    /// Delay before the first allocate retry; doubles on every further retry
    pub allocate_retry_delay: Duration,
    /// Capacity of the trigger channel
    pub trigger_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            match_size: 2,
            fleet: FleetSettings {
                fleet_id: "local-fleet".to_string(),
                region_id: "local".to_string(),
                profile_id: 0,
            },
            poll: PollSettings::default(),
            allocate_max_retries: 3,
            allocate_retry_delay: Duration::from_millis(500),
            trigger_buffer: 64,
        }
    }
}

/// Statistics about engine operations
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Total number of distinct players queued
    pub players_joined: u64,
    /// Total number of matches formed
    pub matches_created: u64,
    /// Matches whose game server became reachable
    pub matches_resolved: u64,
    /// Matches whose allocation disappeared or timed out
    pub matches_aborted: u64,
    /// Matches undone because no allocation could be requested
    pub matches_rolled_back: u64,
    /// Matches released through end-match
    pub matches_ended: u64,
    /// Failed provider calls of any kind
    pub provider_failures: u64,
    /// Provider failures since the last successful provider call
    pub consecutive_provider_failures: u32,
    /// Current number of players waiting in the queue
    pub players_waiting: usize,
    /// Current number of match records
    pub active_matches: usize,
    /// Current number of running allocation tasks
    pub active_allocations: usize,
}

/// The matchmaking engine
#[derive(Clone)]
pub struct MatchmakingEngine {
    /// Registry, directory and queue
    state: Arc<MatchState>,
    /// Allocation provider client
    provider: Arc<dyn AllocationProvider>,
    settings: EngineSettings,
    /// Running allocation tasks by allocation id
    allocation_tasks: Arc<Mutex<HashMap<AllocationId, AbortHandle>>>,
    trigger_tx: mpsc::Sender<()>,
    /// Taken by the coordinator when it starts
    trigger_rx: Arc<Mutex<Option<mpsc::Receiver<()>>>>,
    shutdown_tx: broadcast::Sender<()>,
    coordinator_running: Arc<AtomicBool>,
    stats: Arc<RwLock<EngineStats>>,
    metrics_collector: Arc<MetricsCollector>,
}

impl MatchmakingEngine {
    /// Create a new engine
    pub fn new(provider: Arc<dyn AllocationProvider>, settings: EngineSettings) -> Self {
        let metrics_collector = Arc::new(MetricsCollector::new().unwrap_or_else(|_| {
            warn!("Failed to create metrics collector, using default");
            MetricsCollector::default()
        }));

        Self::with_metrics(provider, settings, metrics_collector)
    }

    /// Create a new engine reporting into `metrics_collector`
    pub fn with_metrics(
        provider: Arc<dyn AllocationProvider>,
        settings: EngineSettings,
        metrics_collector: Arc<MetricsCollector>,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(settings.trigger_buffer.max(1));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            state: Arc::new(MatchState::new()),
            provider,
            settings,
            allocation_tasks: Arc::new(Mutex::new(HashMap::new())),
            trigger_tx,
            trigger_rx: Arc::new(Mutex::new(Some(trigger_rx))),
            shutdown_tx,
            coordinator_running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(RwLock::new(EngineStats::default())),
            metrics_collector,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn state(&self) -> &MatchState {
        &self.state
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics_collector.clone()
    }

    /// Whether the coordinator task is consuming triggers
    pub fn is_running(&self) -> bool {
        self.coordinator_running.load(Ordering::SeqCst)
    }

    /// Spawn the coordinator that forms matches whenever a trigger arrives.
    /// Can only be started once per engine.
    pub fn start(&self) -> Result<JoinHandle<()>> {
        let mut trigger_rx = self
            .trigger_rx
            .lock()
            .map_err(|_| MatchmakingError::lock_poisoned("trigger receiver"))?
            .take()
            .ok_or_else(|| MatchmakingError::InternalError {
                message: "Matchmaking coordinator already started".to_string(),
            })?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let engine = self.clone();
        self.coordinator_running.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            info!(
                "Matchmaking coordinator started (match size {})",
                engine.settings.match_size
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Matchmaking coordinator received shutdown signal");
                        break;
                    }
                    trigger = trigger_rx.recv() => match trigger {
                        Some(()) => {
                            engine.drain_queue();
                        }
                        None => break,
                    }
                }
            }

            engine.coordinator_running.store(false, Ordering::SeqCst);
            info!("Matchmaking coordinator stopped");
        });

        // Players may have joined before the coordinator existed.
        self.trigger();
        Ok(handle)
    }

    /// Stop the coordinator and cancel every running allocation task
    pub fn shutdown(&self) {
        if self.shutdown_tx.send(()).is_err() {
            debug!("Coordinator was not listening for shutdown");
        }

        match self.allocation_tasks.lock() {
            Ok(mut tasks) => {
                let count = tasks.len();
                for (_, task) in tasks.drain() {
                    task.abort();
                }
                info!("Cancelled {} allocation tasks", count);
            }
            Err(_) => error!("Failed to acquire allocation tasks lock during shutdown"),
        }
    }

    /// Handle a join: queue unknown players and report the current match of
    /// known ones.
    pub fn join(&self, request: JoinRequest) -> Result<MatchInfo> {
        let timer = self.metrics_collector.start_timer();

        if request.player_id.is_empty() {
            return Err(MatchmakingError::BadRequest {
                reason: "missing player id".to_string(),
            }
            .into());
        }

        let player = PlayerInfo::new(request.player_id.clone(), request.source_address);
        let result = match self.state.register(player)? {
            Registration::Queued => {
                info!("Player '{}' joined the queue", request.player_id);
                self.update_stats(|stats| stats.players_joined += 1);
                self.metrics_collector.record_player_joined();
                self.trigger();
                MatchInfo::unmatched()
            }
            Registration::Waiting => {
                debug!("Player '{}' is still waiting for a match", request.player_id);
                // Covers players put back in the queue after a failed allocation.
                self.trigger();
                MatchInfo::unmatched()
            }
            Registration::Matched(info) => info,
        };

        self.metrics_collector.record_join_duration(timer.stop());
        Ok(result)
    }

    /// The match a player is part of, or the unmatched response while waiting
    pub fn lookup_player(&self, player_id: &str) -> Result<MatchInfo> {
        self.state.match_for_player(player_id)
    }

    pub fn get_match(&self, allocation_id: &str) -> Result<Option<MatchInfo>> {
        self.state.get_match(allocation_id)
    }

    pub fn all_matches(&self) -> Result<Vec<MatchInfo>> {
        self.state.all_matches()
    }

    /// Ask the coordinator to look for a match. Never blocks; a full channel
    /// already guarantees a pending check.
    pub fn trigger(&self) {
        match self.trigger_tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
            Err(mpsc::error::TrySendError::Closed(())) => {
                warn!("Matchmaking coordinator is gone, trigger dropped")
            }
        }
    }

    /// Form matches until fewer than a full batch of players is queued
    pub fn drain_queue(&self) -> usize {
        let mut formed = 0;
        loop {
            match self.try_form_match() {
                Ok(Some(_)) => formed += 1,
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to form match: {}", e);
                    break;
                }
            }
        }
        formed
    }

    /// Take one batch of players off the queue, create their match and start
    /// its allocation task. Returns `None` when not enough players wait.
    pub fn try_form_match(&self) -> Result<Option<MatchInfo>> {
        let Some(players) = self.state.dequeue_batch(self.settings.match_size)? else {
            return Ok(None);
        };

        let info = self.state.create_match(players)?;
        let Some(allocation_id) = info.allocation_id.clone() else {
            return Err(MatchmakingError::InternalError {
                message: "Created match has no allocation id".to_string(),
            }
            .into());
        };

        self.update_stats(|stats| stats.matches_created += 1);
        self.metrics_collector.record_match_created(info.players.len());
        self.spawn_allocation(allocation_id)?;

        Ok(Some(info))
    }

    /// Release the server of a match and delete the match. Returns the
    /// remaining matches.
    pub async fn end_match(&self, allocation_id: &str) -> Result<Vec<MatchInfo>> {
        if self.state.get_match(allocation_id)?.is_none() {
            info!("End-match for unknown match {}", allocation_id);
            return Err(MatchmakingError::UnknownMatch {
                allocation_id: allocation_id.to_string(),
            }
            .into());
        }

        let timer = self.metrics_collector.start_timer();
        let result = self
            .provider
            .deallocate(&self.settings.fleet.fleet_id, allocation_id)
            .await;
        self.record_provider_result("deallocate", result.is_ok(), timer.stop());

        if let Err(e) = result {
            error!("Deallocate of {} failed: {}", allocation_id, e);
            return Err(MatchmakingError::DeallocationFailed {
                allocation_id: allocation_id.to_string(),
                message: e.to_string(),
            }
            .into());
        }

        if self.cancel_allocation_task(allocation_id) {
            debug!("Cancelled allocation task of {}", allocation_id);
        }

        if self.state.remove_match(allocation_id)?.is_some() {
            info!("Match {} ended", allocation_id);
            self.update_stats(|stats| stats.matches_ended += 1);
            self.metrics_collector.record_match_ended();
        }

        self.state.all_matches()
    }

    /// Get engine statistics
    pub fn get_stats(&self) -> Result<EngineStats> {
        let summary = self.state.summary()?;
        let active_allocations = self
            .allocation_tasks
            .lock()
            .map_err(|_| MatchmakingError::lock_poisoned("allocation tasks"))?
            .len();

        let mut stats = self
            .stats
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("stats"))?
            .clone();
        stats.players_waiting = summary.players_waiting;
        stats.active_matches = summary.active_matches;
        stats.active_allocations = active_allocations;
        Ok(stats)
    }

    fn spawn_allocation(&self, allocation_id: AllocationId) -> Result<()> {
        let mut tasks = self
            .allocation_tasks
            .lock()
            .map_err(|_| MatchmakingError::lock_poisoned("allocation tasks"))?;

        let engine = self.clone();
        let task_id = allocation_id.clone();
        let handle = tokio::spawn(async move { engine.run_allocation(task_id).await });
        tasks.insert(allocation_id, handle.abort_handle());
        Ok(())
    }

    fn cancel_allocation_task(&self, allocation_id: &str) -> bool {
        match self.allocation_tasks.lock() {
            Ok(mut tasks) => match tasks.remove(allocation_id) {
                Some(task) => {
                    task.abort();
                    true
                }
                None => false,
            },
            Err(_) => {
                error!("Failed to acquire allocation tasks lock");
                false
            }
        }
    }

    fn finish_allocation_task(&self, allocation_id: &str) {
        match self.allocation_tasks.lock() {
            Ok(mut tasks) => {
                tasks.remove(allocation_id);
            }
            Err(_) => error!("Failed to acquire allocation tasks lock"),
        }
    }

    async fn run_allocation(self, allocation_id: AllocationId) {
        match self.request_allocation(&allocation_id).await {
            Ok(receipt) => {
                debug!(
                    "Allocation {} requested in region {} at {}",
                    receipt.allocation_id, receipt.region_id, receipt.created
                );
            }
            Err(e) => {
                self.roll_back(&allocation_id, &e).await;
                self.finish_allocation_task(&allocation_id);
                return;
            }
        }

        let report = AllocationPoller::new(
            self.provider.as_ref(),
            &self.settings.fleet,
            &allocation_id,
            self.settings.poll,
            &self.metrics_collector,
        )
        .run()
        .await;

        self.apply_poll_report(&allocation_id, &report);
        self.finish_allocation_task(&allocation_id);
    }

    /// Call `allocate`, retrying with exponential backoff
    async fn request_allocation(&self, allocation_id: &str) -> Result<AllocationReceipt> {
        let fleet = &self.settings.fleet;
        let mut attempt = 0;
        let mut delay = self.settings.allocate_retry_delay;

        loop {
            attempt += 1;
            let timer = self.metrics_collector.start_timer();
            let result = self
                .provider
                .allocate(
                    &fleet.fleet_id,
                    &fleet.region_id,
                    fleet.profile_id,
                    allocation_id,
                )
                .await;
            self.record_provider_result("allocate", result.is_ok(), timer.stop());

            match result {
                Ok(receipt) => return Ok(receipt),
                Err(e) => {
                    if attempt > self.settings.allocate_max_retries {
                        error!(
                            "Failed to allocate {} after {} attempts: {}",
                            allocation_id, attempt, e
                        );
                        return Err(MatchmakingError::ProviderUnavailable {
                            operation: "allocate".to_string(),
                            message: e.to_string(),
                        }
                        .into());
                    }

                    warn!(
                        "Allocate attempt {} for {} failed: {}. Retrying in {:?}",
                        attempt, allocation_id, e, delay
                    );
                    sleep(delay).await;
                    delay = next_backoff(delay, MAX_ALLOCATE_BACKOFF);
                }
            }
        }
    }

    /// Undo a match whose allocation could not be requested. The players go
    /// back to the front of the queue and are matched again on the next
    /// trigger.
    async fn roll_back(&self, allocation_id: &str, cause: &anyhow::Error) {
        warn!(
            "Rolling back match {} after allocation failure: {}",
            allocation_id, cause
        );

        // The provider may have granted the server despite reporting an error.
        if let Err(e) = self
            .provider
            .deallocate(&self.settings.fleet.fleet_id, allocation_id)
            .await
        {
            debug!("Best-effort deallocate of {} failed: {}", allocation_id, e);
        }

        match self.state.release_match(allocation_id) {
            Ok(Some(players)) => {
                info!(
                    "Returned {} players of match {} to the queue",
                    players.len(),
                    allocation_id
                );
                self.update_stats(|stats| stats.matches_rolled_back += 1);
                self.metrics_collector
                    .record_allocation_outcome("rolled_back");
            }
            Ok(None) => debug!("Match {} was already removed", allocation_id),
            Err(e) => error!("Failed to roll back match {}: {}", allocation_id, e),
        }
    }

    fn apply_poll_report(&self, allocation_id: &str, report: &PollReport) {
        let label = report.outcome.phase().to_string();
        let applied = match &report.outcome {
            PollOutcome::Resolved(address) => {
                let applied = self.state.attach_address(allocation_id, address.clone());
                if matches!(applied, Ok(true)) {
                    self.update_stats(|stats| stats.matches_resolved += 1);
                    self.metrics_collector.record_allocation_ready(report.elapsed);
                }
                applied
            }
            PollOutcome::Gone | PollOutcome::TimedOut => {
                warn!(
                    "Marking match {} aborted: allocation {}",
                    allocation_id, label
                );
                let applied = self.state.mark_aborted(allocation_id);
                if matches!(applied, Ok(true)) {
                    self.update_stats(|stats| stats.matches_aborted += 1);
                }
                applied
            }
        };

        match applied {
            Ok(true) => self.metrics_collector.record_allocation_outcome(&label),
            Ok(false) => debug!(
                "Match {} ended before its allocation settled as {}",
                allocation_id, label
            ),
            Err(e) => error!(
                "Failed to record {} outcome for {}: {}",
                label, allocation_id, e
            ),
        }
    }

    fn record_provider_result(&self, operation: &str, success: bool, duration: Duration) {
        self.metrics_collector
            .record_provider_call(operation, success, duration);
        self.update_stats(|stats| {
            if success {
                stats.consecutive_provider_failures = 0;
            } else {
                stats.provider_failures += 1;
                stats.consecutive_provider_failures += 1;
            }
        });
    }

    fn update_stats(&self, update: impl FnOnce(&mut EngineStats)) {
        match self.stats.write() {
            Ok(mut stats) => update(&mut stats),
            Err(_) => error!("Failed to acquire stats lock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::as_matchmaking_error;
    use crate::matchmaking::provider::{
        AllocationStatus, LoopbackAllocationProvider, MockAllocationProvider,
    };
    use chrono::Utc;

    fn test_settings() -> EngineSettings {
        EngineSettings {
            match_size: 2,
            fleet: FleetSettings {
                fleet_id: "fleet".to_string(),
                region_id: "region".to_string(),
                profile_id: 7,
            },
            poll: PollSettings {
                interval: Duration::from_millis(10),
                deadline: Some(Duration::from_secs(5)),
            },
            allocate_max_retries: 1,
            allocate_retry_delay: Duration::from_millis(5),
            trigger_buffer: 16,
        }
    }

    fn join_request(id: &str) -> JoinRequest {
        JoinRequest {
            player_id: id.to_string(),
            source_address: Some("127.0.0.1:50000".to_string()),
        }
    }

    fn receipt(allocation_id: &str) -> AllocationReceipt {
        AllocationReceipt {
            allocation_id: allocation_id.to_string(),
            profile_id: 7,
            region_id: "region".to_string(),
            created: Utc::now(),
        }
    }

    async fn wait_until(what: &str, condition: impl Fn() -> bool) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    fn loopback_engine() -> MatchmakingEngine {
        MatchmakingEngine::new(
            Arc::new(LoopbackAllocationProvider::new("127.0.0.1", 7777, 1)),
            test_settings(),
        )
    }

    #[tokio::test]
    async fn test_join_rejects_empty_player_id() {
        let engine = loopback_engine();

        let err = engine.join(join_request("")).unwrap_err();
        assert!(matches!(
            as_matchmaking_error(&err),
            Some(MatchmakingError::BadRequest { .. })
        ));
        assert_eq!(engine.get_stats().unwrap().players_waiting, 0);
    }

    #[tokio::test]
    async fn test_pair_gets_allocated_address() {
        let allocated = Arc::new(Mutex::new(Vec::<String>::new()));
        let mut provider = MockAllocationProvider::new();
        {
            let allocated = allocated.clone();
            provider
                .expect_allocate()
                .times(1)
                .returning(move |fleet, region, profile, id| {
                    assert_eq!((fleet, region, profile), ("fleet", "region", 7));
                    allocated.lock().unwrap().push(id.to_string());
                    Ok(receipt(id))
                });
        }
        let mut polls = 0;
        provider
            .expect_poll_allocations()
            .returning(move |_, _, _, _| {
                polls += 1;
                if polls < 3 {
                    Ok(vec![AllocationStatus::pending()])
                } else {
                    Ok(vec![AllocationStatus::ready("10.0.0.5", 7777)])
                }
            });

        let engine = MatchmakingEngine::new(Arc::new(provider), test_settings());
        let coordinator = engine.start().unwrap();

        let first = engine.join(join_request("p1")).unwrap();
        assert!(!first.matched);

        engine.join(join_request("p2")).unwrap();
        wait_until("p1 address", || {
            engine
                .lookup_player("p1")
                .map(|info| info.address.is_some())
                .unwrap_or(false)
        })
        .await;

        let info = engine.lookup_player("p1").unwrap();
        let ids: Vec<&str> = info.players.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2"]);
        assert_eq!(info.address.as_ref().unwrap().host, "10.0.0.5");
        assert_eq!(
            allocated.lock().unwrap().as_slice(),
            &[info.allocation_id.clone().unwrap()]
        );

        // Joining again is idempotent and reports the same match
        assert_eq!(engine.join(join_request("p1")).unwrap(), info);
        assert_eq!(engine.join(join_request("p1")).unwrap(), info);

        let stats = engine.get_stats().unwrap();
        assert_eq!(stats.matches_created, 1);
        assert_eq!(stats.matches_resolved, 1);

        engine.shutdown();
        coordinator.await.unwrap();
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_vanished_allocation_marks_match_aborted() {
        let mut provider = MockAllocationProvider::new();
        provider
            .expect_allocate()
            .returning(|_, _, _, id| Ok(receipt(id)));
        provider
            .expect_poll_allocations()
            .returning(|_, _, _, _| Ok(Vec::new()));

        let engine = MatchmakingEngine::new(Arc::new(provider), test_settings());
        engine.join(join_request("p1")).unwrap();
        engine.join(join_request("p2")).unwrap();
        let info = engine.try_form_match().unwrap().unwrap();
        let allocation_id = info.allocation_id.unwrap();

        wait_until("aborted flag", || {
            engine
                .get_match(&allocation_id)
                .unwrap()
                .map(|m| m.aborted)
                .unwrap_or(false)
        })
        .await;

        let stored = engine.lookup_player("p2").unwrap();
        assert!(stored.aborted);
        assert!(stored.address.is_none());
        assert_eq!(engine.get_stats().unwrap().matches_aborted, 1);
    }

    #[tokio::test]
    async fn test_end_match_unknown_id() {
        let engine = loopback_engine();
        engine.join(join_request("p1")).unwrap();

        let err = engine.end_match("no-such-match").await.unwrap_err();
        assert!(matches!(
            as_matchmaking_error(&err),
            Some(MatchmakingError::UnknownMatch { .. })
        ));
        assert_eq!(engine.lookup_player("p1").unwrap(), MatchInfo::unmatched());
    }

    #[tokio::test]
    async fn test_end_match_keeps_record_when_deallocate_fails() {
        let mut provider = MockAllocationProvider::new();
        provider
            .expect_allocate()
            .returning(|_, _, _, id| Ok(receipt(id)));
        provider
            .expect_poll_allocations()
            .returning(|_, _, _, _| Ok(vec![AllocationStatus::ready("10.0.0.9", 9000)]));
        provider
            .expect_deallocate()
            .returning(|_, _| Err(anyhow::anyhow!("503 from provider")));

        let engine = MatchmakingEngine::new(Arc::new(provider), test_settings());
        engine.join(join_request("p1")).unwrap();
        engine.join(join_request("p2")).unwrap();
        let allocation_id = engine
            .try_form_match()
            .unwrap()
            .unwrap()
            .allocation_id
            .unwrap();

        let err = engine.end_match(&allocation_id).await.unwrap_err();
        assert!(matches!(
            as_matchmaking_error(&err),
            Some(MatchmakingError::DeallocationFailed { .. })
        ));
        assert!(engine.get_match(&allocation_id).unwrap().is_some());
        assert!(engine.lookup_player("p1").unwrap().matched);
    }

    #[tokio::test]
    async fn test_end_match_cancels_polling() {
        let mut provider = MockAllocationProvider::new();
        provider
            .expect_allocate()
            .returning(|_, _, _, id| Ok(receipt(id)));
        provider
            .expect_poll_allocations()
            .returning(|_, _, _, _| Ok(vec![AllocationStatus::pending()]));
        provider.expect_deallocate().times(1).returning(|_, _| Ok(()));

        let engine = MatchmakingEngine::new(Arc::new(provider), test_settings());
        engine.join(join_request("p1")).unwrap();
        engine.join(join_request("p2")).unwrap();
        let allocation_id = engine
            .try_form_match()
            .unwrap()
            .unwrap()
            .allocation_id
            .unwrap();
        assert_eq!(engine.get_stats().unwrap().active_allocations, 1);

        let remaining = engine.end_match(&allocation_id).await.unwrap();
        assert!(remaining.is_empty());

        let stats = engine.get_stats().unwrap();
        assert_eq!(stats.active_allocations, 0);
        assert_eq!(stats.active_matches, 0);
        assert_eq!(stats.matches_ended, 1);
        assert!(engine.state().lookup("p1").unwrap().is_none());

        sleep(Duration::from_millis(50)).await;
        assert!(engine.get_match(&allocation_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_allocation_returns_players_to_queue() {
        let mut provider = MockAllocationProvider::new();
        provider
            .expect_allocate()
            .times(2)
            .returning(|_, _, _, _| Err(anyhow::anyhow!("provider down")));
        provider.expect_deallocate().returning(|_, _| Ok(()));

        let engine = MatchmakingEngine::new(Arc::new(provider), test_settings());
        engine.join(join_request("p1")).unwrap();
        engine.join(join_request("p2")).unwrap();
        engine.try_form_match().unwrap().unwrap();

        wait_until("rollback", || {
            engine
                .get_stats()
                .map(|s| s.matches_rolled_back == 1 && s.active_allocations == 0)
                .unwrap_or(false)
        })
        .await;

        let stats = engine.get_stats().unwrap();
        assert_eq!(stats.players_waiting, 2);
        assert_eq!(stats.active_matches, 0);
        assert!(stats.consecutive_provider_failures >= 2);
        assert_eq!(engine.lookup_player("p1").unwrap(), MatchInfo::unmatched());
        assert!(engine.state().integrity_violations().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_triggers_form_one_match() {
        let engine = loopback_engine();
        engine.join(join_request("p1")).unwrap();
        engine.join(join_request("p2")).unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.try_form_match().unwrap().is_some() })
            })
            .collect();

        let created = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|result| *result.as_ref().unwrap())
            .count();

        assert_eq!(created, 1);
        assert_eq!(engine.get_stats().unwrap().matches_created, 1);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let engine = loopback_engine();
        let _coordinator = engine.start().unwrap();
        assert!(engine.start().is_err());
        engine.shutdown();
    }
}
