//! Matchmaking core: queue, player directory, match registry and the engine
//! that ties them to the allocation provider.

pub mod directory;
pub mod engine;
pub mod lifecycle;
pub mod provider;
pub mod queue;
pub mod registry;
pub mod state;

pub use engine::{EngineSettings, EngineStats, MatchmakingEngine};
pub use lifecycle::{AllocationPhase, AllocationPoller, PollOutcome, PollReport, PollSettings};
pub use provider::{
    AllocationProvider, AllocationReceipt, AllocationStatus, FleetSettings,
    LoopbackAllocationProvider,
};
pub use state::{MatchState, Registration, StateSummary};
