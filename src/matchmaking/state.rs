//! Shared matchmaking state
//!
//! [`MatchState`] owns the match registry, the player directory and the
//! unmatched queue. Each sits behind its own lock. Operations that touch more
//! than one structure take the locks in the fixed order
//! registry → directory → queue and hold them for the whole update, so
//! concurrent readers never observe a half-applied change.

use crate::error::{MatchmakingError, Result};
use crate::matchmaking::directory::PlayerDirectory;
use crate::matchmaking::queue::UnmatchedQueue;
use crate::matchmaking::registry::MatchRegistry;
use crate::types::{AllocationId, AssignmentState, MatchInfo, PlayerInfo, ServerAddress};
use crate::utils::generate_allocation_id;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info};

/// Result of registering a join
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// First time this player was seen; they are now at the back of the queue
    Queued,
    /// Already known and still waiting for a match
    Waiting,
    /// Already part of a match
    Matched(MatchInfo),
}

/// Point-in-time sizes of the shared structures
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateSummary {
    pub players_waiting: usize,
    pub known_players: usize,
    pub active_matches: usize,
    pub ready_matches: usize,
    pub aborted_matches: usize,
}

#[derive(Debug, Default)]
pub struct MatchState {
    registry: RwLock<MatchRegistry>,
    directory: RwLock<PlayerDirectory>,
    queue: Mutex<UnmatchedQueue>,
}

impl MatchState {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_registry(&self) -> Result<RwLockReadGuard<'_, MatchRegistry>> {
        self.registry
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("registry").into())
    }

    fn write_registry(&self) -> Result<RwLockWriteGuard<'_, MatchRegistry>> {
        self.registry
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("registry").into())
    }

    fn read_directory(&self) -> Result<RwLockReadGuard<'_, PlayerDirectory>> {
        self.directory
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("directory").into())
    }

    fn write_directory(&self) -> Result<RwLockWriteGuard<'_, PlayerDirectory>> {
        self.directory
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("directory").into())
    }

    fn lock_queue(&self) -> Result<MutexGuard<'_, UnmatchedQueue>> {
        self.queue
            .lock()
            .map_err(|_| MatchmakingError::lock_poisoned("queue").into())
    }

    /// Register a join. Unknown players are recorded as unassigned and
    /// appended to the queue; known players get their current standing back
    /// and are never queued twice.
    pub fn register(&self, player: PlayerInfo) -> Result<Registration> {
        let registry = self.read_registry()?;
        let mut directory = self.write_directory()?;

        match directory.get(&player.id).cloned() {
            Some(AssignmentState::Unassigned) => Ok(Registration::Waiting),
            Some(AssignmentState::Assigned(allocation_id)) => registry
                .get(&allocation_id)
                .cloned()
                .map(Registration::Matched)
                .ok_or_else(|| integrity_violation(&player.id, &allocation_id)),
            None => {
                let mut queue = self.lock_queue()?;
                directory.insert_unassigned(&player.id);
                debug!(
                    "Player '{}' queued at position {}",
                    player.id,
                    queue.len() + 1
                );
                queue.push(player);
                Ok(Registration::Queued)
            }
        }
    }

    /// Current assignment of a player, if the player is known
    pub fn lookup(&self, player_id: &str) -> Result<Option<AssignmentState>> {
        let directory = self.read_directory()?;
        Ok(directory.get(player_id).cloned())
    }

    /// The match a player belongs to, or the unmatched response while they
    /// are still waiting.
    pub fn match_for_player(&self, player_id: &str) -> Result<MatchInfo> {
        let registry = self.read_registry()?;
        let directory = self.read_directory()?;

        match directory.get(player_id) {
            None => Err(MatchmakingError::PlayerNotFound {
                player_id: player_id.to_string(),
            }
            .into()),
            Some(AssignmentState::Unassigned) => Ok(MatchInfo::unmatched()),
            Some(AssignmentState::Assigned(allocation_id)) => registry
                .get(allocation_id)
                .cloned()
                .ok_or_else(|| integrity_violation(player_id, allocation_id)),
        }
    }

    /// Atomically take the first `n` queued players. Nothing is removed
    /// unless at least `n` are waiting.
    pub fn dequeue_batch(&self, n: usize) -> Result<Option<Vec<PlayerInfo>>> {
        let mut queue = self.lock_queue()?;
        Ok(queue.take_batch(n))
    }

    /// Create a match record for `players` and point their directory entries
    /// at it in one step.
    pub fn create_match(&self, players: Vec<PlayerInfo>) -> Result<MatchInfo> {
        if players.is_empty() {
            return Err(MatchmakingError::InternalError {
                message: "Cannot create a match without players".to_string(),
            }
            .into());
        }

        let allocation_id = generate_allocation_id();
        let info = MatchInfo::new_match(allocation_id.clone(), players);

        let mut registry = self.write_registry()?;
        let mut directory = self.write_directory()?;

        for player in &info.players {
            directory.assign(&player.id, &allocation_id);
        }
        registry.insert(info.clone());

        info!(
            "Created match {} with players [{}]",
            allocation_id,
            player_list(&info)
        );
        Ok(info)
    }

    pub fn get_match(&self, allocation_id: &str) -> Result<Option<MatchInfo>> {
        let registry = self.read_registry()?;
        Ok(registry.get(allocation_id).cloned())
    }

    /// Returns false if the match was removed in the meantime.
    pub fn attach_address(&self, allocation_id: &str, address: ServerAddress) -> Result<bool> {
        let mut registry = self.write_registry()?;
        Ok(registry.attach_address(allocation_id, address))
    }

    /// Returns false if the match was removed in the meantime.
    pub fn mark_aborted(&self, allocation_id: &str) -> Result<bool> {
        let mut registry = self.write_registry()?;
        Ok(registry.mark_aborted(allocation_id))
    }

    /// Delete a match and the directory entries of its players.
    pub fn remove_match(&self, allocation_id: &str) -> Result<Option<MatchInfo>> {
        let mut registry = self.write_registry()?;
        let mut directory = self.write_directory()?;

        let removed = registry.remove(allocation_id);
        if let Some(info) = &removed {
            for player in &info.players {
                if points_at(&directory, &player.id, allocation_id) {
                    directory.remove(&player.id);
                }
            }
        }
        Ok(removed)
    }

    /// Undo a match whose allocation could not be obtained: delete the record
    /// and put its players back at the front of the queue as unassigned.
    pub fn release_match(&self, allocation_id: &str) -> Result<Option<Vec<PlayerInfo>>> {
        let mut registry = self.write_registry()?;
        let mut directory = self.write_directory()?;
        let mut queue = self.lock_queue()?;

        let Some(info) = registry.remove(allocation_id) else {
            return Ok(None);
        };

        let players: Vec<PlayerInfo> = info
            .players
            .into_iter()
            .filter(|player| points_at(&directory, &player.id, allocation_id))
            .collect();
        for player in &players {
            directory.unassign(&player.id);
        }
        queue.requeue_front(players.clone());

        Ok(Some(players))
    }

    pub fn all_matches(&self) -> Result<Vec<MatchInfo>> {
        let registry = self.read_registry()?;
        Ok(registry.values().cloned().collect())
    }

    pub fn summary(&self) -> Result<StateSummary> {
        let registry = self.read_registry()?;
        let directory = self.read_directory()?;
        let queue = self.lock_queue()?;

        Ok(StateSummary {
            players_waiting: queue.len(),
            known_players: directory.len(),
            active_matches: registry.len(),
            ready_matches: registry.values().filter(|m| m.is_ready()).count(),
            aborted_matches: registry.values().filter(|m| m.aborted).count(),
        })
    }

    /// Check the cross-structure invariants and describe every violation
    /// found. An empty list means the state is consistent.
    pub fn integrity_violations(&self) -> Result<Vec<String>> {
        let registry = self.read_registry()?;
        let directory = self.read_directory()?;
        let queue = self.lock_queue()?;
        let mut violations = Vec::new();

        for info in registry.values() {
            let Some(allocation_id) = info.allocation_id.as_deref() else {
                violations.push("match record without allocation id".to_string());
                continue;
            };
            for player in &info.players {
                if !points_at(&directory, &player.id, allocation_id) {
                    violations.push(format!(
                        "player '{}' in match {} has no matching directory entry",
                        player.id, allocation_id
                    ));
                }
            }
        }

        for (player_id, state) in directory.iter() {
            if let AssignmentState::Assigned(allocation_id) = state {
                match registry.get(allocation_id) {
                    Some(info) if info.has_player(player_id) => {}
                    Some(_) => violations.push(format!(
                        "player '{}' points at match {} that does not list them",
                        player_id, allocation_id
                    )),
                    None => violations.push(format!(
                        "player '{}' points at missing match {}",
                        player_id, allocation_id
                    )),
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        for player in queue.iter() {
            if !seen.insert(player.id.as_str()) {
                violations.push(format!("player '{}' queued twice", player.id));
            }
            if directory.get(&player.id) != Some(&AssignmentState::Unassigned) {
                violations.push(format!(
                    "queued player '{}' is not unassigned in the directory",
                    player.id
                ));
            }
        }

        Ok(violations)
    }
}

fn points_at(directory: &PlayerDirectory, player_id: &str, allocation_id: &str) -> bool {
    matches!(
        directory.get(player_id),
        Some(AssignmentState::Assigned(id)) if id == allocation_id
    )
}

fn integrity_violation(player_id: &str, allocation_id: &AllocationId) -> anyhow::Error {
    error!(
        "Integrity violation - player '{}' is assigned to missing match {}",
        player_id, allocation_id
    );
    MatchmakingError::IntegrityError {
        player_id: player_id.to_string(),
        allocation_id: allocation_id.clone(),
    }
    .into()
}

fn player_list(info: &MatchInfo) -> String {
    info.players
        .iter()
        .map(|p| p.id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::as_matchmaking_error;
    use std::sync::Arc;

    fn join(state: &MatchState, id: &str) -> Registration {
        state.register(PlayerInfo::new(id, None)).unwrap()
    }

    fn form_match(state: &MatchState, size: usize) -> Option<MatchInfo> {
        state
            .dequeue_batch(size)
            .unwrap()
            .map(|players| state.create_match(players).unwrap())
    }

    #[test]
    fn test_register_is_idempotent() {
        let state = MatchState::new();

        assert_eq!(join(&state, "p1"), Registration::Queued);
        assert_eq!(join(&state, "p1"), Registration::Waiting);
        assert_eq!(state.summary().unwrap().players_waiting, 1);
        assert!(state.integrity_violations().unwrap().is_empty());
    }

    #[test]
    fn test_create_match_assigns_players() {
        let state = MatchState::new();
        join(&state, "p1");
        join(&state, "p2");

        let info = form_match(&state, 2).unwrap();
        let allocation_id = info.allocation_id.clone().unwrap();

        assert_eq!(
            state.lookup("p1").unwrap(),
            Some(AssignmentState::Assigned(allocation_id.clone()))
        );
        assert_eq!(join(&state, "p2"), Registration::Matched(info.clone()));
        assert_eq!(state.match_for_player("p1").unwrap(), info);
        assert!(state.integrity_violations().unwrap().is_empty());
    }

    #[test]
    fn test_dequeue_requires_full_batch() {
        let state = MatchState::new();
        join(&state, "p1");

        assert!(form_match(&state, 2).is_none());
        assert_eq!(state.summary().unwrap().players_waiting, 1);
        assert_eq!(state.match_for_player("p1").unwrap(), MatchInfo::unmatched());
    }

    #[test]
    fn test_remove_match_forgets_players() {
        let state = MatchState::new();
        join(&state, "p1");
        join(&state, "p2");
        let info = form_match(&state, 2).unwrap();
        let allocation_id = info.allocation_id.unwrap();

        let removed = state.remove_match(&allocation_id).unwrap();
        assert!(removed.is_some());
        assert!(state.lookup("p1").unwrap().is_none());
        assert!(state.lookup("p2").unwrap().is_none());
        assert!(state.get_match(&allocation_id).unwrap().is_none());
        assert!(state.remove_match(&allocation_id).unwrap().is_none());
    }

    #[test]
    fn test_release_match_requeues_in_order() {
        let state = MatchState::new();
        for id in ["p1", "p2", "p3"] {
            join(&state, id);
        }
        let info = form_match(&state, 2).unwrap();

        let released = state
            .release_match(info.allocation_id.as_deref().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(released.len(), 2);

        let batch = state.dequeue_batch(3).unwrap().unwrap();
        let order: Vec<&str> = batch.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(order, vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn test_address_after_removal_is_dropped() {
        let state = MatchState::new();
        join(&state, "p1");
        join(&state, "p2");
        let allocation_id = form_match(&state, 2).unwrap().allocation_id.unwrap();
        state.remove_match(&allocation_id).unwrap();

        let attached = state
            .attach_address(
                &allocation_id,
                ServerAddress {
                    host: "127.0.0.1".to_string(),
                    port: 7777,
                },
            )
            .unwrap();
        assert!(!attached);
        assert!(!state.mark_aborted(&allocation_id).unwrap());
        assert!(state.all_matches().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_player_lookup() {
        let state = MatchState::new();
        let err = state.match_for_player("nobody").unwrap_err();
        assert!(matches!(
            as_matchmaking_error(&err),
            Some(MatchmakingError::PlayerNotFound { .. })
        ));
    }

    #[test]
    fn test_concurrent_dequeue_single_winner() {
        for _ in 0..50 {
            let state = Arc::new(MatchState::new());
            join(&state, "p1");
            join(&state, "p2");

            let winners: usize = std::thread::scope(|scope| {
                let handles: Vec<_> = (0..8)
                    .map(|_| {
                        let state = state.clone();
                        scope.spawn(move || state.dequeue_batch(2).unwrap().is_some())
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap() as usize)
                    .sum()
            });

            assert_eq!(winners, 1);
        }
    }
}
