//! FIFO queue of players waiting to be paired

use crate::types::PlayerInfo;
use std::collections::VecDeque;

/// Players waiting for a match, in arrival order
#[derive(Debug, Default, Clone)]
pub struct UnmatchedQueue {
    players: VecDeque<PlayerInfo>,
}

impl UnmatchedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a player to the back of the queue
    pub fn push(&mut self, player: PlayerInfo) {
        self.players.push_back(player);
    }

    /// Put players back at the front, keeping their relative order
    pub fn requeue_front(&mut self, players: Vec<PlayerInfo>) {
        for player in players.into_iter().rev() {
            self.players.push_front(player);
        }
    }

    /// Remove and return the first `n` players, or nothing at all when fewer
    /// than `n` are waiting.
    pub fn take_batch(&mut self, n: usize) -> Option<Vec<PlayerInfo>> {
        if n == 0 || self.players.len() < n {
            return None;
        }
        Some(self.players.drain(..n).collect())
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlayerInfo> {
        self.players.iter()
    }
}
