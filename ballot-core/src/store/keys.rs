//! Co-located key namespaces
//!
//! Hash tags (the `{...}` segment) pin every key of a family to one shard so
//! multi-key operations within a family stay single-slot. The formats are
//! wire compatibility surface; changing them breaks mixed-version clusters.

/// `{nodes}.<node_id>`: directory hash for one node
pub fn node(node_id: &str) -> String {
    format!("{{nodes}}.{}", node_id)
}

/// Scan pattern for the whole node directory
pub fn node_pattern() -> String {
    "{nodes}.*".to_string()
}

/// Node id embedded in a directory key
pub fn node_id_of(key: &str) -> Option<&str> {
    key.strip_prefix("{nodes}.")
}

/// `{votes}.<vote_id>`: hash of one finalized vote
pub fn vote(vote_id: &str) -> String {
    format!("{{votes}}.{}", vote_id)
}

/// Scan pattern for all finalized votes of one election (vote ids are
/// `<election_id>:<voter_id>:<suffix>`)
pub fn vote_pattern(election_id: &str) -> String {
    format!("{{votes}}.{}:*", election_id)
}

/// `{election}.<election_id>.voters`: set of voter ids
pub fn voters(election_id: &str) -> String {
    format!("{{election}}.{}.voters", election_id)
}

/// `{election}.<election_id>.candidate.<candidate_id>`: tally counter
pub fn candidate(election_id: &str, candidate_id: &str) -> String {
    format!("{{election}}.{}.candidate.{}", election_id, candidate_id)
}

/// Scan pattern for one election's tally counters
pub fn candidate_pattern(election_id: &str) -> String {
    format!("{{election}}.{}.candidate.*", election_id)
}

/// Candidate id embedded in a tally counter key
pub fn candidate_of(key: &str) -> Option<&str> {
    key.rsplit_once(".candidate.").map(|(_, cid)| cid)
}

/// `{consensus}.<proposal_id>`: hash of a pending/finalized proposal
pub fn proposal(proposal_id: &str) -> String {
    format!("{{consensus}}.{}", proposal_id)
}

/// Scan pattern for all proposal records
pub fn proposal_pattern() -> String {
    "{consensus}.*".to_string()
}

/// Scan pattern for one election's proposal records
pub fn proposal_pattern_for(election_id: &str) -> String {
    format!("{{consensus}}.{}:*", election_id)
}

/// Proposal id embedded in a consensus key
pub fn proposal_id_of(key: &str) -> Option<&str> {
    key.strip_prefix("{consensus}.")
}

/// `{mutex}:<resource>`: opaque lock value
pub fn mutex(resource: &str) -> String {
    format!("{{mutex}}:{}", resource)
}

/// `{system}.time`: leader wall time at the last broadcast
pub fn system_time() -> String {
    "{system}.time".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_formats_are_exact() {
        assert_eq!(node("node1"), "{nodes}.node1");
        assert_eq!(vote("e1:v1:abc"), "{votes}.e1:v1:abc");
        assert_eq!(voters("e1"), "{election}.e1.voters");
        assert_eq!(candidate("e1", "c1"), "{election}.e1.candidate.c1");
        assert_eq!(proposal("e1:v1:abc"), "{consensus}.e1:v1:abc");
        assert_eq!(mutex("reset:e1"), "{mutex}:reset:e1");
        assert_eq!(system_time(), "{system}.time");
    }

    #[test]
    fn test_key_extractors() {
        assert_eq!(node_id_of("{nodes}.node2"), Some("node2"));
        assert_eq!(candidate_of("{election}.e1.candidate.c9"), Some("c9"));
        assert_eq!(proposal_id_of("{consensus}.e1:v1:x"), Some("e1:v1:x"));
        assert_eq!(candidate_of("{election}.e1.voters"), None);
    }
}
