//! Match registry: the source of truth for match records

use crate::types::{AllocationId, MatchInfo, ServerAddress};
use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct MatchRegistry {
    matches: HashMap<AllocationId, MatchInfo>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record keyed by its allocation id. Records without an id are
    /// not matches and are ignored.
    pub fn insert(&mut self, info: MatchInfo) {
        if let Some(id) = info.allocation_id.clone() {
            self.matches.insert(id, info);
        }
    }

    pub fn get(&self, allocation_id: &str) -> Option<&MatchInfo> {
        self.matches.get(allocation_id)
    }

    /// Returns false when the record no longer exists.
    pub fn attach_address(&mut self, allocation_id: &str, address: ServerAddress) -> bool {
        match self.matches.get_mut(allocation_id) {
            Some(info) => {
                info.address = Some(address);
                true
            }
            None => false,
        }
    }

    /// Returns false when the record no longer exists.
    pub fn mark_aborted(&mut self, allocation_id: &str) -> bool {
        match self.matches.get_mut(allocation_id) {
            Some(info) => {
                info.aborted = true;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, allocation_id: &str) -> Option<MatchInfo> {
        self.matches.remove(allocation_id)
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &MatchInfo> {
        self.matches.values()
    }
}
