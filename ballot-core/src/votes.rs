//! Finalized-vote effect layer
//!
//! Deterministic writes keyed by vote id: the voter set is written first and
//! the candidate counter increments only when the voter was newly added, so
//! a replayed finalization cannot double count. Tallies read the counter
//! family; recounting finalized votes in memory is the verification path.

use crate::bus::Channel;
use crate::store::{keys, SharedStore, StoreResult};
use crate::types::{wall_clock, Ballot, VoteId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Messages on the `election_admin` channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AdminMessage {
    /// Peers clear their in-memory mirrors for the election
    #[serde(rename = "reset_election")]
    ResetElection { election_id: String },
}

/// Tally of one election
#[derive(Debug, Clone, Serialize)]
pub struct Tally {
    pub election_id: String,
    pub total_votes: i64,
    pub results: HashMap<String, i64>,
}

/// Outcome of an election reset; failures are reported, not hidden.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResetReport {
    pub removed_keys: usize,
    pub failed_keys: Vec<String>,
}

impl ResetReport {
    pub fn complete(&self) -> bool {
        self.failed_keys.is_empty()
    }
}

/// Store-side vote effects, shared by the consensus layer and the HTTP
/// surface.
#[derive(Clone)]
pub struct VoteStore {
    store: Arc<dyn SharedStore>,
}

impl VoteStore {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Record a finalized vote: voter set, candidate counter, vote hash.
    /// Idempotent by vote id.
    pub async fn record_finalized(&self, vote_id: &VoteId, ballot: &Ballot) -> StoreResult<()> {
        let newly_added = self
            .store
            .add_to_set(&keys::voters(&ballot.election_id), &ballot.voter_id)
            .await?;

        if newly_added {
            let count = self
                .store
                .increment_counter(&keys::candidate(&ballot.election_id, &ballot.candidate_id))
                .await?;
            info!(
                "VoteStore: recorded {} for {} (candidate {} now {})",
                vote_id, ballot.election_id, ballot.candidate_id, count
            );
        } else {
            warn!(
                "VoteStore: voter {} already counted in {}, skipping counter",
                ballot.voter_id, ballot.election_id
            );
        }

        let fields = vec![
            ("vote_id".to_string(), vote_id.clone()),
            ("voter_id".to_string(), ballot.voter_id.clone()),
            ("election_id".to_string(), ballot.election_id.clone()),
            ("candidate_id".to_string(), ballot.candidate_id.clone()),
            ("timestamp".to_string(), ballot.timestamp.to_string()),
            ("signature".to_string(), ballot.signature.clone()),
            ("content_hash".to_string(), ballot.content_hash()),
            ("stored_at".to_string(), wall_clock().to_string()),
        ];
        self.store.hash_set(&keys::vote(vote_id), &fields).await?;
        Ok(())
    }

    /// Whether `(voter, election)` already has a finalized vote cluster-wide.
    pub async fn has_voted(&self, election_id: &str, voter_id: &str) -> StoreResult<bool> {
        self.store
            .is_member(&keys::voters(election_id), voter_id)
            .await
    }

    /// Authoritative tally from the candidate counter family.
    pub async fn tally(&self, election_id: &str) -> StoreResult<Tally> {
        let mut results = HashMap::new();
        let mut total = 0i64;

        for key in self
            .store
            .scan(&keys::candidate_pattern(election_id))
            .await?
        {
            let Some(candidate_id) = keys::candidate_of(&key) else {
                continue;
            };
            let count = self
                .store
                .get_value(&key)
                .await?
                .and_then(|raw| raw.parse::<i64>().ok())
                .unwrap_or(0);
            total += count;
            results.insert(candidate_id.to_string(), count);
        }

        Ok(Tally {
            election_id: election_id.to_string(),
            total_votes: total,
            results,
        })
    }

    /// Delete every store record of one election: counters, voter set, vote
    /// hashes and leftover proposal records. Per-key failures are collected
    /// so the caller can decide on re-invocation.
    pub async fn reset_election(&self, election_id: &str) -> StoreResult<ResetReport> {
        let mut report = ResetReport::default();

        let mut targets: Vec<String> = Vec::new();
        targets.extend(
            self.store
                .scan(&keys::candidate_pattern(election_id))
                .await?,
        );
        targets.push(keys::voters(election_id));
        targets.extend(self.store.scan(&keys::vote_pattern(election_id)).await?);
        targets.extend(
            self.store
                .scan(&keys::proposal_pattern_for(election_id))
                .await?,
        );

        for key in targets {
            match self.store.delete(&key).await {
                Ok(removed) => {
                    if removed {
                        report.removed_keys += 1;
                    }
                }
                Err(err) => {
                    error!("VoteStore: reset failed to delete {}: {}", key, err);
                    report.failed_keys.push(key);
                }
            }
        }

        info!(
            "VoteStore: reset {} removed {} keys ({} failures)",
            election_id,
            report.removed_keys,
            report.failed_keys.len()
        );
        Ok(report)
    }

    /// Announce a reset so peers clear their in-memory mirrors.
    pub async fn broadcast_reset(
        &self,
        com: &crate::bus::Communicator,
        election_id: &str,
    ) -> StoreResult<()> {
        com.broadcast(
            Channel::ElectionAdmin,
            &AdminMessage::ResetElection {
                election_id: election_id.to_string(),
            },
        )
        .await
    }
}
