//! Common types used throughout the matchmaking service

use crate::utils::current_timestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for players
pub type PlayerId = String;

/// Identifier of a game-server allocation, and the primary key of a match
pub type AllocationId = String;

/// A player known to the matchmaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: PlayerId,
    /// Address the join came from. Informational only, never an identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    pub joined_at: DateTime<Utc>,
}

impl PlayerInfo {
    pub fn new(id: impl Into<PlayerId>, origin: Option<String>) -> Self {
        Self {
            id: id.into(),
            origin,
            joined_at: current_timestamp(),
        }
    }
}

/// Network location of an allocated game server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Outcome of matchmaking as seen by a player
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchInfo {
    pub matched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_id: Option<AllocationId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub players: Vec<PlayerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<ServerAddress>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl MatchInfo {
    /// Response for a player that is still waiting in the queue
    pub fn unmatched() -> Self {
        Self {
            matched: false,
            allocation_id: None,
            players: Vec::new(),
            address: None,
            aborted: false,
            created_at: None,
        }
    }

    /// A freshly formed match that has not been allocated yet
    pub fn new_match(allocation_id: AllocationId, players: Vec<PlayerInfo>) -> Self {
        Self {
            matched: true,
            allocation_id: Some(allocation_id),
            players,
            address: None,
            aborted: false,
            created_at: Some(current_timestamp()),
        }
    }

    /// Whether the game server is ready to accept the players
    pub fn is_ready(&self) -> bool {
        self.address.is_some()
    }

    pub fn has_player(&self, player_id: &str) -> bool {
        self.players.iter().any(|p| p.id == player_id)
    }
}

/// Where a known player currently stands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentState {
    Unassigned,
    Assigned(AllocationId),
}

/// Inbound join request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    #[serde(default)]
    pub player_id: PlayerId,
    #[serde(default)]
    pub source_address: Option<String>,
}

/// Inbound end-match request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndMatchRequest {
    #[serde(default)]
    pub allocation_id: AllocationId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmatched_serializes_minimal() {
        let json = serde_json::to_value(MatchInfo::unmatched()).unwrap();
        assert_eq!(json, serde_json::json!({ "matched": false }));
    }

    #[test]
    fn test_aborted_match_serialization() {
        let mut info = MatchInfo::new_match(
            "alloc-1".to_string(),
            vec![PlayerInfo::new("p1", None), PlayerInfo::new("p2", None)],
        );
        info.aborted = true;

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["matched"], true);
        assert_eq!(json["allocation_id"], "alloc-1");
        assert_eq!(json["aborted"], true);
        assert!(json.get("address").is_none());
        assert_eq!(json["players"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_join_request_without_source() {
        let request: JoinRequest = serde_json::from_str(r#"{"player_id":"p1"}"#).unwrap();
        assert_eq!(request.player_id, "p1");
        assert!(request.source_address.is_none());
    }

    #[test]
    fn test_server_address_display() {
        let address = ServerAddress {
            host: "10.0.0.1".to_string(),
            port: 7777,
        };
        assert_eq!(address.to_string(), "10.0.0.1:7777");
    }
}
