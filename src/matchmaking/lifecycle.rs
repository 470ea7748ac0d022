//! Allocation lifecycle: polling the provider until an allocation settles
//!
//! An allocation starts in [`AllocationPhase::Requested`] once the provider
//! accepted the request. On every tick the poller asks the provider for the
//! allocation's status:
//!
//! - a failed query leaves it `Requested` until the next tick
//! - an empty result means the provider dropped it: `Gone`
//! - a result carrying an address settles it: `Resolved`
//!
//! The whole loop is bounded by an optional deadline, after which the
//! allocation is `TimedOut`.

use crate::matchmaking::provider::{AllocationProvider, AllocationStatus, FleetSettings};
use crate::metrics::MetricsCollector;
use crate::types::ServerAddress;
use std::time::Duration;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationPhase {
    Requested,
    Resolved,
    Gone,
    TimedOut,
}

impl std::fmt::Display for AllocationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocationPhase::Requested => write!(f, "requested"),
            AllocationPhase::Resolved => write!(f, "resolved"),
            AllocationPhase::Gone => write!(f, "gone"),
            AllocationPhase::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Terminal result of a poll loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Resolved(ServerAddress),
    Gone,
    TimedOut,
}

impl PollOutcome {
    pub fn phase(&self) -> AllocationPhase {
        match self {
            PollOutcome::Resolved(_) => AllocationPhase::Resolved,
            PollOutcome::Gone => AllocationPhase::Gone,
            PollOutcome::TimedOut => AllocationPhase::TimedOut,
        }
    }
}

/// Outcome plus what it took to get there
#[derive(Debug, Clone)]
pub struct PollReport {
    pub outcome: PollOutcome,
    pub polls: u32,
    pub failed_polls: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    /// Time between two status queries
    pub interval: Duration,
    /// Give up after this long; `None` polls until the allocation settles
    pub deadline: Option<Duration>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            deadline: Some(Duration::from_secs(300)),
        }
    }
}

/// Drives one allocation from `Requested` to a terminal phase
pub struct AllocationPoller<'a> {
    provider: &'a dyn AllocationProvider,
    fleet: &'a FleetSettings,
    allocation_id: &'a str,
    settings: PollSettings,
    metrics: &'a MetricsCollector,
}

#[derive(Default)]
struct PollCounters {
    polls: u32,
    failed_polls: u32,
}

impl<'a> AllocationPoller<'a> {
    pub fn new(
        provider: &'a dyn AllocationProvider,
        fleet: &'a FleetSettings,
        allocation_id: &'a str,
        settings: PollSettings,
        metrics: &'a MetricsCollector,
    ) -> Self {
        Self {
            provider,
            fleet,
            allocation_id,
            settings,
            metrics,
        }
    }

    /// Poll until the allocation resolves, disappears or the deadline passes
    pub async fn run(&self) -> PollReport {
        let started = Instant::now();
        let mut counters = PollCounters::default();

        let outcome = match self.settings.deadline {
            Some(deadline) => timeout(deadline, self.poll_until_settled(&mut counters))
                .await
                .unwrap_or(PollOutcome::TimedOut),
            None => self.poll_until_settled(&mut counters).await,
        };

        let report = PollReport {
            outcome,
            polls: counters.polls,
            failed_polls: counters.failed_polls,
            elapsed: started.elapsed(),
        };

        info!(
            "Allocation {} settled as {} after {} polls ({} failed) in {:.1}s",
            self.allocation_id,
            report.outcome.phase(),
            report.polls,
            report.failed_polls,
            report.elapsed.as_secs_f64()
        );
        report
    }

    async fn poll_until_settled(&self, counters: &mut PollCounters) -> PollOutcome {
        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the first query waits one interval.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            counters.polls += 1;

            let timer = self.metrics.start_timer();
            let result = self
                .provider
                .poll_allocations(
                    &self.fleet.fleet_id,
                    &self.fleet.region_id,
                    self.fleet.profile_id,
                    self.allocation_id,
                )
                .await;
            self.metrics
                .record_provider_call("poll", result.is_ok(), timer.stop());

            match result {
                Err(e) => {
                    counters.failed_polls += 1;
                    warn!(
                        "Polling allocation {} failed (attempt {}): {}",
                        self.allocation_id, counters.polls, e
                    );
                }
                Ok(statuses) if statuses.is_empty() => {
                    warn!(
                        "Allocation {} disappeared from the provider",
                        self.allocation_id
                    );
                    return PollOutcome::Gone;
                }
                Ok(statuses) => match statuses.first().and_then(AllocationStatus::address) {
                    Some(address) => {
                        info!("Got allocation {}: {}", self.allocation_id, address);
                        return PollOutcome::Resolved(address);
                    }
                    None => debug!("Waiting for allocation {}", self.allocation_id),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchmaking::provider::MockAllocationProvider;

    fn fleet() -> FleetSettings {
        FleetSettings {
            fleet_id: "fleet".to_string(),
            region_id: "region".to_string(),
            profile_id: 42,
        }
    }

    fn fast(deadline: Option<Duration>) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(5),
            deadline,
        }
    }

    #[tokio::test]
    async fn test_resolves_after_pending_and_failures() {
        let mut provider = MockAllocationProvider::new();
        let mut calls = 0;
        provider
            .expect_poll_allocations()
            .times(4)
            .returning(move |fleet, region, profile, id| {
                assert_eq!((fleet, region, profile, id), ("fleet", "region", 42, "a1"));
                calls += 1;
                match calls {
                    1 => Err(anyhow::anyhow!("connection reset")),
                    2 | 3 => Ok(vec![AllocationStatus::pending()]),
                    _ => Ok(vec![AllocationStatus::ready("10.1.1.1", 7777)]),
                }
            });

        let metrics = MetricsCollector::new().unwrap();
        let fleet = fleet();
        let poller = AllocationPoller::new(&provider, &fleet, "a1", fast(None), &metrics);
        let report = poller.run().await;

        assert_eq!(
            report.outcome,
            PollOutcome::Resolved(ServerAddress {
                host: "10.1.1.1".to_string(),
                port: 7777,
            })
        );
        assert_eq!(report.polls, 4);
        assert_eq!(report.failed_polls, 1);
    }

    #[tokio::test]
    async fn test_empty_result_is_gone() {
        let mut provider = MockAllocationProvider::new();
        provider
            .expect_poll_allocations()
            .times(1)
            .returning(|_, _, _, _| Ok(Vec::new()));

        let metrics = MetricsCollector::new().unwrap();
        let fleet = fleet();
        let report = AllocationPoller::new(&provider, &fleet, "a1", fast(None), &metrics)
            .run()
            .await;

        assert_eq!(report.outcome, PollOutcome::Gone);
        assert_eq!(report.outcome.phase(), AllocationPhase::Gone);
    }

    #[tokio::test]
    async fn test_deadline_stops_endless_pending() {
        let mut provider = MockAllocationProvider::new();
        provider
            .expect_poll_allocations()
            .returning(|_, _, _, _| Ok(vec![AllocationStatus::pending()]));

        let metrics = MetricsCollector::new().unwrap();
        let fleet = fleet();
        let report = AllocationPoller::new(
            &provider,
            &fleet,
            "a1",
            fast(Some(Duration::from_millis(60))),
            &metrics,
        )
        .run()
        .await;

        assert_eq!(report.outcome, PollOutcome::TimedOut);
        assert!(report.polls >= 1);
    }

    #[test]
    fn test_outcome_labels() {
        let resolved = PollOutcome::Resolved(ServerAddress {
            host: "10.1.1.1".to_string(),
            port: 7777,
        });
        assert_eq!(resolved.phase().to_string(), "resolved");
        assert_eq!(PollOutcome::Gone.phase().to_string(), "gone");
        assert_eq!(PollOutcome::TimedOut.phase().to_string(), "timed_out");
        assert_eq!(AllocationPhase::Requested.to_string(), "requested");
    }
}
