//! Core types for the voting cluster

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique identifier for a cluster node
pub type NodeId = String;

/// Unique identifier for a submitted vote, `<election_id>:<voter_id>:<suffix>`
pub type VoteId = String;

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Coordinates proposals and is the clock reference
    Leader,
    /// Accepts proposals from the leader
    Follower,
    /// Attempting to become leader
    Candidate,
}

impl Default for Role {
    fn default() -> Self {
        Role::Follower
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader => write!(f, "leader"),
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "leader" => Ok(Role::Leader),
            "follower" => Ok(Role::Follower),
            "candidate" => Ok(Role::Candidate),
            _ => Err(()),
        }
    }
}

/// Lifecycle status of a node's directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    Shutdown,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Active => write!(f, "active"),
            NodeStatus::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// A vote as submitted by a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ballot {
    pub voter_id: String,
    pub election_id: String,
    pub candidate_id: String,
    #[serde(default = "wall_clock")]
    pub timestamp: f64,
    #[serde(default)]
    pub signature: String,
}

impl Ballot {
    /// Check that the identifying fields are non-empty.
    pub fn check_fields(&self) -> Result<(), &'static str> {
        if self.voter_id.trim().is_empty() {
            return Err("voter_id cannot be empty");
        }
        if self.election_id.trim().is_empty() {
            return Err("election_id cannot be empty");
        }
        if self.candidate_id.trim().is_empty() {
            return Err("candidate_id cannot be empty");
        }
        Ok(())
    }

    /// SHA-256 over the identifying fields, for audit records.
    pub fn content_hash(&self) -> String {
        let content = format!(
            "{}:{}:{}:{}",
            self.voter_id, self.election_id, self.candidate_id, self.timestamp
        );
        let digest = Sha256::digest(content.as_bytes());
        hex::encode(digest)
    }
}

impl std::fmt::Display for Ballot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Ballot(voter={}, election={}, candidate={})",
            self.voter_id, self.election_id, self.candidate_id
        )
    }
}

/// A node's view of the current election: its role, the term, and the
/// recognized leader if any. Fanned out on a watch channel so subsystems
/// react to role changes without reaching into the election module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleView {
    pub role: Role,
    pub term: u64,
    pub leader: Option<NodeId>,
}

impl RoleView {
    /// Initial view from the configured role hint.
    pub fn initial(role: Role, node_id: &str) -> Self {
        Self {
            role,
            term: 0,
            leader: (role == Role::Leader).then(|| node_id.to_string()),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }
}

impl Default for RoleView {
    fn default() -> Self {
        Self {
            role: Role::Follower,
            term: 0,
            leader: None,
        }
    }
}

/// Current Unix wall-clock time in seconds
pub fn wall_clock() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Build a vote id whose prefix keys all derived records to one shard family.
pub fn new_vote_id(election_id: &str, voter_id: &str) -> VoteId {
    format!("{}:{}:{}", election_id, voter_id, Uuid::new_v4())
}

/// Election id embedded in a vote id, if well-formed.
pub fn election_of_vote_id(vote_id: &str) -> Option<&str> {
    vote_id.split(':').next().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Ballot {
        Ballot {
            voter_id: "v1".to_string(),
            election_id: "e1".to_string(),
            candidate_id: "c1".to_string(),
            timestamp: 1000.0,
            signature: String::new(),
        }
    }

    #[test]
    fn test_check_fields_rejects_blank() {
        let mut ballot = sample();
        assert!(ballot.check_fields().is_ok());

        ballot.voter_id = "  ".to_string();
        assert!(ballot.check_fields().is_err());
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = sample();
        let b = sample();
        assert_eq!(a.content_hash(), b.content_hash());

        let mut c = sample();
        c.candidate_id = "c2".to_string();
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn test_vote_id_embeds_election_and_voter() {
        let vote_id = new_vote_id("e1", "v1");
        assert!(vote_id.starts_with("e1:v1:"));
        assert_eq!(election_of_vote_id(&vote_id), Some("e1"));
    }

    #[test]
    fn test_ballot_deserializes_with_defaults() {
        let ballot: Ballot =
            serde_json::from_str(r#"{"voter_id":"v","election_id":"e","candidate_id":"c"}"#)
                .unwrap();
        assert!(ballot.timestamp > 0.0);
        assert!(ballot.signature.is_empty());
    }

    #[test]
    fn test_role_round_trip() {
        let role: Role = "leader".parse().unwrap();
        assert_eq!(role, Role::Leader);
        assert_eq!(serde_json::to_string(&role).unwrap(), "\"leader\"");
    }
}
