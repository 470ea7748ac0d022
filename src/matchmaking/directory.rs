//! Player directory: which allocation, if any, each known player belongs to

use crate::types::{AllocationId, AssignmentState, PlayerId};
use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct PlayerDirectory {
    entries: HashMap<PlayerId, AssignmentState>,
}

impl PlayerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, player_id: &str) -> Option<&AssignmentState> {
        self.entries.get(player_id)
    }

    /// Record a new player as unassigned. Returns false if the player was
    /// already known, in which case nothing changes.
    pub fn insert_unassigned(&mut self, player_id: &str) -> bool {
        if self.entries.contains_key(player_id) {
            return false;
        }
        self.entries
            .insert(player_id.to_string(), AssignmentState::Unassigned);
        true
    }

    pub fn assign(&mut self, player_id: &str, allocation_id: &AllocationId) {
        self.entries.insert(
            player_id.to_string(),
            AssignmentState::Assigned(allocation_id.clone()),
        );
    }

    pub fn unassign(&mut self, player_id: &str) {
        if let Some(entry) = self.entries.get_mut(player_id) {
            *entry = AssignmentState::Unassigned;
        }
    }

    pub fn remove(&mut self, player_id: &str) -> Option<AssignmentState> {
        self.entries.remove(player_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PlayerId, &AssignmentState)> {
        self.entries.iter()
    }
}
