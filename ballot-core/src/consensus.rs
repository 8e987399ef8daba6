//! Per-vote consensus
//!
//! Leader-coordinated replication with quorum acknowledgment. A submitted
//! vote is validated, assigned a deterministic id, persisted as a proposal
//! record, then proposed by the leader; followers validate and acknowledge;
//! a quorum of approvals finalizes the vote into the store effects exactly
//! once. Proposals survive leader changes through their `{consensus}.*`
//! records: a new leader re-proposes whatever is still pending.

use crate::bus::{Channel, Communicator, Envelope};
use crate::clock::ClockSync;
use crate::config::ConsensusTiming;
use crate::directory::{Directory, PeerSet};
use crate::store::{keys, SharedStore, StoreError, StoreResult};
use crate::types::{new_vote_id, wall_clock, Ballot, NodeId, RoleView, VoteId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Finalized proposal records are kept for audit before expiring
const PROPOSAL_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Messages on the `vote_proposal` channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ProposalMessage {
    /// A non-leader hands its submission to the leader
    #[serde(rename = "vote_forward")]
    VoteForward { vote_id: VoteId, vote: Ballot },

    /// Leader asks the cluster to admit a vote
    #[serde(rename = "vote_propose")]
    VotePropose { vote_id: VoteId, vote: Ballot },
}

/// Messages on the `vote_response` channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AckMessage {
    #[serde(rename = "vote_acknowledge")]
    VoteAcknowledge { vote_id: VoteId, status: AckStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Approved,
    Rejected,
}

/// Messages on the `vote_finalization` channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FinalizeMessage {
    #[serde(rename = "vote_finalized")]
    VoteFinalized { vote_id: VoteId, vote: Ballot },
}

/// Submission failures, mapped onto the HTTP taxonomy by the boundary
#[derive(Debug, Error)]
pub enum SubmitError {
    /// User fault: empty fields, timestamp out of tolerance
    #[error("{0}")]
    Invalid(String),

    #[error("voter has already cast a vote in this election")]
    AlreadyVoted,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Client-visible status of one vote
#[derive(Debug, Clone)]
pub enum VoteStatus {
    Finalized(Ballot),
    Pending {
        approvals: usize,
        total_nodes: usize,
        approval_percentage: u32,
    },
    Unknown,
}

#[derive(Debug, Clone)]
struct PendingVote {
    ballot: Ballot,
    since: Instant,
}

/// Mutable consensus bookkeeping, confined behind one lock
#[derive(Default)]
struct ConsensusState {
    pending: HashMap<VoteId, PendingVote>,
    approvals: HashMap<VoteId, HashSet<NodeId>>,
    rejections: HashMap<VoteId, u32>,
    finalized: HashMap<VoteId, Ballot>,
    /// voter_id → election_id → vote_id
    voter_history: HashMap<String, HashMap<String, VoteId>>,
}

impl ConsensusState {
    fn forget(&mut self, vote_id: &VoteId) {
        self.pending.remove(vote_id);
        self.approvals.remove(vote_id);
        self.rejections.remove(vote_id);
    }

    fn already_voted(&self, voter_id: &str, election_id: &str) -> bool {
        self.voter_history
            .get(voter_id)
            .is_some_and(|elections| elections.contains_key(election_id))
    }

    fn record_history(&mut self, ballot: &Ballot, vote_id: &VoteId) {
        self.voter_history
            .entry(ballot.voter_id.clone())
            .or_default()
            .insert(ballot.election_id.clone(), vote_id.clone());
    }
}

/// The consensus coordinator for one node
pub struct Consensus {
    node_id: NodeId,
    timing: ConsensusTiming,
    state: RwLock<ConsensusState>,
    store: Arc<dyn SharedStore>,
    votes: crate::votes::VoteStore,
    com: Communicator,
    clock: Arc<ClockSync>,
    directory: Arc<Directory>,
    role_rx: watch::Receiver<RoleView>,
    peers_rx: watch::Receiver<PeerSet>,
    votes_processed: AtomicU64,
}

impl Consensus {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        timing: ConsensusTiming,
        store: Arc<dyn SharedStore>,
        com: Communicator,
        clock: Arc<ClockSync>,
        directory: Arc<Directory>,
        role_rx: watch::Receiver<RoleView>,
        peers_rx: watch::Receiver<PeerSet>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            timing,
            state: RwLock::new(ConsensusState::default()),
            votes: crate::votes::VoteStore::new(store.clone()),
            store,
            com,
            clock,
            directory,
            role_rx,
            peers_rx,
            votes_processed: AtomicU64::new(0),
        })
    }

    pub fn votes_processed(&self) -> u64 {
        self.votes_processed.load(Ordering::Relaxed)
    }

    pub fn vote_store(&self) -> &crate::votes::VoteStore {
        &self.votes
    }

    fn is_leader(&self) -> bool {
        self.role_rx.borrow().is_leader()
    }

    fn total_nodes(&self) -> usize {
        self.peers_rx.borrow().len() + 1
    }

    /// Accept a vote submission on this node and start the consensus flow.
    pub async fn submit(self: &Arc<Self>, ballot: Ballot) -> Result<VoteId, SubmitError> {
        ballot
            .check_fields()
            .map_err(|reason| SubmitError::Invalid(reason.to_string()))?;
        self.clock
            .validate_timestamp(ballot.timestamp)
            .map_err(|err| SubmitError::Invalid(err.to_string()))?;

        if self.state.read().await.already_voted(&ballot.voter_id, &ballot.election_id) {
            return Err(SubmitError::AlreadyVoted);
        }
        if self
            .votes
            .has_voted(&ballot.election_id, &ballot.voter_id)
            .await?
        {
            return Err(SubmitError::AlreadyVoted);
        }

        let vote_id = new_vote_id(&ballot.election_id, &ballot.voter_id);
        info!(
            "Consensus: accepted {} from {} as {}",
            ballot, ballot.voter_id, vote_id
        );

        {
            let mut state = self.state.write().await;
            state.pending.insert(
                vote_id.clone(),
                PendingVote {
                    ballot: ballot.clone(),
                    since: Instant::now(),
                },
            );
            state
                .approvals
                .entry(vote_id.clone())
                .or_default()
                .insert(self.node_id.clone());
        }

        self.persist_proposal(&vote_id, &ballot).await?;

        if self.is_leader() {
            self.propose(&vote_id, &ballot).await;
        } else {
            self.forward_to_leader(&vote_id, &ballot).await;
        }

        self.spawn_recheck(vote_id.clone());
        Ok(vote_id)
    }

    /// Write the proposal record the cluster recovers from on leader change.
    async fn persist_proposal(&self, vote_id: &VoteId, ballot: &Ballot) -> StoreResult<()> {
        let key = keys::proposal(vote_id);
        let fields = vec![
            ("vote_id".to_string(), vote_id.clone()),
            ("vote".to_string(), serde_json::to_string(ballot)?),
            ("proposed_by".to_string(), self.node_id.clone()),
            ("proposed_at".to_string(), wall_clock().to_string()),
            ("status".to_string(), "pending".to_string()),
        ];
        self.store.hash_set(&key, &fields).await?;
        self.store.expire(&key, self.timing.pending_ttl).await?;
        Ok(())
    }

    async fn mark_proposal(&self, vote_id: &VoteId, status: &str, retention: Duration) {
        let key = keys::proposal(vote_id);
        let fields = vec![("status".to_string(), status.to_string())];
        if let Err(err) = self.store.hash_set(&key, &fields).await {
            warn!("Consensus: could not mark {} {}: {}", vote_id, status, err);
            return;
        }
        if let Err(err) = self.store.expire(&key, retention).await {
            warn!("Consensus: could not re-expire {}: {}", vote_id, err);
        }
    }

    async fn propose(&self, vote_id: &VoteId, ballot: &Ballot) {
        let message = ProposalMessage::VotePropose {
            vote_id: vote_id.clone(),
            vote: ballot.clone(),
        };
        if let Err(err) = self.com.broadcast(Channel::VoteProposal, &message).await {
            // The rechecker keeps driving this vote; a lost propose only
            // delays quorum.
            error!("Consensus: propose broadcast for {} failed: {}", vote_id, err);
        }
    }

    async fn forward_to_leader(&self, vote_id: &VoteId, ballot: &Ballot) {
        match self.directory.find_leader().await {
            Ok(Some(leader)) => {
                info!("Consensus: forwarding {} to leader {}", vote_id, leader);
            }
            Ok(None) => {
                warn!("Consensus: no active leader found for {}", vote_id);
            }
            Err(err) => {
                warn!("Consensus: leader lookup failed for {}: {}", vote_id, err);
            }
        }
        let message = ProposalMessage::VoteForward {
            vote_id: vote_id.clone(),
            vote: ballot.clone(),
        };
        if let Err(err) = self.com.broadcast(Channel::VoteProposal, &message).await {
            error!("Consensus: forward of {} failed: {}", vote_id, err);
        }
    }

    /// Background driver for one vote: first check after 2s, then every 3s
    /// while the vote stays pending.
    fn spawn_recheck(self: &Arc<Self>, vote_id: VoteId) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.timing.initial_recheck).await;
            loop {
                if !this.state.read().await.pending.contains_key(&vote_id) {
                    return;
                }
                if this.is_leader() {
                    this.check_quorum(&vote_id).await;
                }
                tokio::time::sleep(this.timing.recheck_interval).await;
            }
        });
    }

    /// Validate a proposed vote the way a submission is validated, plus the
    /// cluster-wide voter check.
    async fn evaluate(&self, ballot: &Ballot) -> AckStatus {
        if ballot.check_fields().is_err() {
            return AckStatus::Rejected;
        }
        if self.clock.validate_timestamp(ballot.timestamp).is_err() {
            return AckStatus::Rejected;
        }
        if self
            .state
            .read()
            .await
            .already_voted(&ballot.voter_id, &ballot.election_id)
        {
            return AckStatus::Rejected;
        }
        match self
            .votes
            .has_voted(&ballot.election_id, &ballot.voter_id)
            .await
        {
            Ok(true) => AckStatus::Rejected,
            Ok(false) => AckStatus::Approved,
            Err(err) => {
                // Cannot verify against the store; the leader re-checks at
                // finalization, so approve rather than stall the quorum.
                warn!("Consensus: voter check unavailable: {}", err);
                AckStatus::Approved
            }
        }
    }

    /// Inbound `vote_proposal` traffic.
    pub async fn handle_proposal(self: &Arc<Self>, envelope: Envelope<ProposalMessage>) {
        let sender = envelope.sender;
        match envelope.payload {
            ProposalMessage::VoteForward { vote_id, vote } => {
                // Only the leader adopts forwarded submissions; followers
                // will see the subsequent propose.
                if !self.is_leader() {
                    return;
                }
                info!("Consensus: adopting forwarded {} from {}", vote_id, sender);
                self.adopt(&vote_id, &vote, Some(&sender)).await;
            }
            ProposalMessage::VotePropose { vote_id, vote } => {
                debug!("Consensus: proposal {} from {}", vote_id, sender);
                let status = self.evaluate(&vote).await;
                {
                    let mut state = self.state.write().await;
                    state.pending.entry(vote_id.clone()).or_insert(PendingVote {
                        ballot: vote.clone(),
                        since: Instant::now(),
                    });
                    let approvals = state.approvals.entry(vote_id.clone()).or_default();
                    // The proposing node stands behind its own proposal
                    approvals.insert(sender.clone());
                    if status == AckStatus::Approved {
                        approvals.insert(self.node_id.clone());
                    }
                }

                let ack = AckMessage::VoteAcknowledge {
                    vote_id: vote_id.clone(),
                    status,
                };
                if let Err(err) = self.com.broadcast(Channel::VoteResponse, &ack).await {
                    warn!("Consensus: acknowledge of {} failed: {}", vote_id, err);
                }

                if self.is_leader() {
                    self.check_quorum(&vote_id).await;
                }
            }
        }
    }

    /// Take ownership of a vote (forwarded or reconciled) and propose it.
    async fn adopt(self: &Arc<Self>, vote_id: &VoteId, ballot: &Ballot, forwarder: Option<&NodeId>) {
        {
            let mut state = self.state.write().await;
            state.pending.entry(vote_id.clone()).or_insert(PendingVote {
                ballot: ballot.clone(),
                since: Instant::now(),
            });
            let approvals = state.approvals.entry(vote_id.clone()).or_default();
            approvals.insert(self.node_id.clone());
            if let Some(forwarder) = forwarder {
                approvals.insert(forwarder.clone());
            }
        }
        if let Err(err) = self.persist_proposal(vote_id, ballot).await {
            warn!("Consensus: could not persist proposal {}: {}", vote_id, err);
        }
        self.propose(vote_id, ballot).await;
        self.check_quorum(vote_id).await;
        self.spawn_recheck(vote_id.clone());
    }

    /// Inbound `vote_response` traffic (leader tallies these).
    pub async fn handle_ack(self: &Arc<Self>, envelope: Envelope<AckMessage>) {
        let sender = envelope.sender;
        let AckMessage::VoteAcknowledge { vote_id, status } = envelope.payload;

        match status {
            AckStatus::Approved => {
                debug!("Consensus: approval for {} from {}", vote_id, sender);
                {
                    let mut state = self.state.write().await;
                    state
                        .approvals
                        .entry(vote_id.clone())
                        .or_default()
                        .insert(sender);
                }
                if self.is_leader() {
                    self.check_quorum(&vote_id).await;
                }
            }
            AckStatus::Rejected => {
                warn!("Consensus: rejection for {} from {}", vote_id, sender);
                let abandoned = {
                    let mut state = self.state.write().await;
                    let rejections = state.rejections.entry(vote_id.clone()).or_default();
                    *rejections += 1;
                    let majority = *rejections as usize * 2 > self.total_nodes();
                    if majority && state.pending.contains_key(&vote_id) {
                        state.forget(&vote_id);
                        true
                    } else {
                        false
                    }
                };
                if abandoned && self.is_leader() {
                    warn!("Consensus: {} rejected by majority, abandoning", vote_id);
                    self.mark_proposal(&vote_id, "rejected", Duration::from_secs(60))
                        .await;
                }
            }
        }
    }

    /// Finalize when more than half the cluster has approved.
    async fn check_quorum(self: &Arc<Self>, vote_id: &VoteId) {
        let total = self.total_nodes();
        let approvals = {
            let state = self.state.read().await;
            if !state.pending.contains_key(vote_id) {
                return;
            }
            state.approvals.get(vote_id).map_or(0, HashSet::len)
        };

        if approvals * 2 > total {
            info!(
                "Consensus: quorum for {} ({}/{} approvals)",
                vote_id, approvals, total
            );
            self.finalize(vote_id).await;
        } else {
            debug!(
                "Consensus: no quorum yet for {} ({}/{})",
                vote_id, approvals, total
            );
        }
    }

    /// Move a vote from pending to finalized and apply the store effects.
    /// The pending-map removal makes this single-shot per vote id.
    async fn finalize(self: &Arc<Self>, vote_id: &VoteId) {
        let Some(ballot) = ({
            let state = self.state.read().await;
            state.pending.get(vote_id).map(|pending| pending.ballot.clone())
        }) else {
            return;
        };

        // A concurrent submission for the same voter may have finalized
        // first cluster-wide; this one must not double count.
        match self
            .votes
            .has_voted(&ballot.election_id, &ballot.voter_id)
            .await
        {
            Ok(true) => {
                let duplicate = {
                    let state = self.state.read().await;
                    state
                        .voter_history
                        .get(&ballot.voter_id)
                        .and_then(|elections| elections.get(&ballot.election_id))
                        .map_or(true, |recorded| recorded != vote_id)
                };
                if duplicate {
                    warn!("Consensus: {} lost the duplicate race, rejecting", vote_id);
                    self.state.write().await.forget(vote_id);
                    self.mark_proposal(vote_id, "rejected", Duration::from_secs(60))
                        .await;
                    return;
                }
            }
            Ok(false) => {}
            Err(err) => warn!("Consensus: duplicate re-check unavailable: {}", err),
        }

        // Commit locally; a same-voter race between this node's own tasks is
        // resolved here, under the one lock.
        let committed = {
            let mut state = self.state.write().await;
            if state.finalized.contains_key(vote_id) || !state.pending.contains_key(vote_id) {
                // Another task finalized or expired this vote meanwhile
                return;
            }
            if state
                .voter_history
                .get(&ballot.voter_id)
                .and_then(|elections| elections.get(&ballot.election_id))
                .is_some_and(|recorded| recorded != vote_id)
            {
                warn!("Consensus: {} superseded by an earlier finalize", vote_id);
                state.forget(vote_id);
                false
            } else {
                state.pending.remove(vote_id);
                state.finalized.insert(vote_id.clone(), ballot.clone());
                state.record_history(&ballot, vote_id);
                true
            }
        };
        if !committed {
            self.mark_proposal(vote_id, "rejected", Duration::from_secs(60))
                .await;
            return;
        }

        if let Err(err) = self.votes.record_finalized(vote_id, &ballot).await {
            // Counters are write-forward; reset_election is the corrective path
            error!("Consensus: store effects for {} failed: {}", vote_id, err);
        }
        self.mark_proposal(vote_id, "finalized", PROPOSAL_RETENTION)
            .await;

        self.votes_processed.fetch_add(1, Ordering::Relaxed);
        info!("Consensus: finalized {}", vote_id);

        let message = FinalizeMessage::VoteFinalized {
            vote_id: vote_id.clone(),
            vote: ballot,
        };
        if let Err(err) = self.com.broadcast(Channel::VoteFinalization, &message).await {
            error!("Consensus: finalization broadcast failed: {}", err);
        }
    }

    /// Inbound `vote_finalization` traffic: apply the leader's decision
    /// locally without touching the store counters.
    pub async fn handle_finalized(&self, envelope: Envelope<FinalizeMessage>) {
        let FinalizeMessage::VoteFinalized { vote_id, vote } = envelope.payload;
        info!(
            "Consensus: finalization of {} from {}",
            vote_id, envelope.sender
        );

        let mut state = self.state.write().await;
        if state.finalized.contains_key(&vote_id) {
            return;
        }
        state.forget(&vote_id);
        state.record_history(&vote, &vote_id);
        state.finalized.insert(vote_id, vote);
        drop(state);

        self.votes_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Inbound `election_admin` traffic: clear local mirrors for a reset.
    pub async fn handle_admin(&self, envelope: Envelope<crate::votes::AdminMessage>) {
        let crate::votes::AdminMessage::ResetElection { election_id } = envelope.payload;
        info!(
            "Consensus: clearing mirrors for {} (reset by {})",
            election_id, envelope.sender
        );
        self.clear_election(&election_id).await;
    }

    /// Drop every in-memory trace of one election.
    pub async fn clear_election(&self, election_id: &str) {
        let mut state = self.state.write().await;

        let stale: Vec<VoteId> = state
            .pending
            .iter()
            .filter(|(_, pending)| pending.ballot.election_id == election_id)
            .map(|(id, _)| id.clone())
            .collect();
        for vote_id in stale {
            state.forget(&vote_id);
        }

        state
            .finalized
            .retain(|_, ballot| ballot.election_id != election_id);
        for elections in state.voter_history.values_mut() {
            elections.remove(election_id);
        }
        state.voter_history.retain(|_, elections| !elections.is_empty());
    }

    /// On gaining leadership, re-adopt proposals still pending in the store
    /// whose proposer is gone. Deterministic vote ids keep this idempotent.
    pub async fn reconcile_pending(self: &Arc<Self>) {
        let proposal_keys = match self.store.scan(&keys::proposal_pattern()).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!("Consensus: reconciliation scan failed: {}", err);
                return;
            }
        };

        for key in proposal_keys {
            let record = match self.store.hash_get_all(&key).await {
                Ok(record) => record,
                Err(err) => {
                    warn!("Consensus: could not read {}: {}", key, err);
                    continue;
                }
            };
            if record.get("status").map(String::as_str) != Some("pending") {
                continue;
            }
            if record.get("proposed_by") == Some(&self.node_id) {
                continue;
            }
            let (Some(vote_id), Some(raw_vote)) = (record.get("vote_id"), record.get("vote"))
            else {
                continue;
            };
            if self.state.read().await.finalized.contains_key(vote_id) {
                continue;
            }
            let ballot: Ballot = match serde_json::from_str(raw_vote) {
                Ok(ballot) => ballot,
                Err(err) => {
                    warn!("Consensus: undecodable proposal {}: {}", key, err);
                    continue;
                }
            };

            info!(
                "Consensus: new leader re-proposing {} (was proposed by {:?})",
                vote_id,
                record.get("proposed_by")
            );
            self.adopt(vote_id, &ballot, None).await;
        }
    }

    /// Abandon proposals that lingered past the pending TTL.
    pub async fn expire_pending(&self) {
        let ttl = self.timing.pending_ttl;
        let expired: Vec<VoteId> = {
            let state = self.state.read().await;
            state
                .pending
                .iter()
                .filter(|(_, pending)| pending.since.elapsed() > ttl)
                .map(|(id, _)| id.clone())
                .collect()
        };

        if expired.is_empty() {
            return;
        }
        let mut state = self.state.write().await;
        for vote_id in &expired {
            warn!("Consensus: proposal {} expired without quorum", vote_id);
            state.forget(vote_id);
        }
        drop(state);
        for vote_id in &expired {
            if let Err(err) = self.store.delete(&keys::proposal(vote_id)).await {
                warn!("Consensus: could not drop record {}: {}", vote_id, err);
            }
        }
    }

    /// Client-visible status of one vote id.
    pub async fn vote_status(&self, vote_id: &VoteId) -> VoteStatus {
        let state = self.state.read().await;
        if let Some(ballot) = state.finalized.get(vote_id) {
            return VoteStatus::Finalized(ballot.clone());
        }
        if state.pending.contains_key(vote_id) {
            let approvals = state.approvals.get(vote_id).map_or(0, HashSet::len);
            let total_nodes = self.total_nodes();
            return VoteStatus::Pending {
                approvals,
                total_nodes,
                approval_percentage: (100 * approvals / total_nodes.max(1)) as u32,
            };
        }
        VoteStatus::Unknown
    }

    /// Verification tally from the in-memory finalized set; agrees with the
    /// counter family at quiescence.
    pub async fn recount(&self, election_id: &str) -> HashMap<String, i64> {
        let state = self.state.read().await;
        let mut counts: HashMap<String, i64> = HashMap::new();
        for ballot in state.finalized.values() {
            if ballot.election_id == election_id {
                *counts.entry(ballot.candidate_id.clone()).or_default() += 1;
            }
        }
        counts
    }

    pub async fn pending_count(&self) -> usize {
        self.state.read().await.pending.len()
    }
}

/// Consensus background task: single consumer for the proposal, response,
/// finalization and admin channels, the pending GC tick, and leadership
/// reconciliation.
pub async fn run_consensus_loop(
    consensus: Arc<Consensus>,
    mut proposal_rx: mpsc::Receiver<Envelope<ProposalMessage>>,
    mut ack_rx: mpsc::Receiver<Envelope<AckMessage>>,
    mut finalize_rx: mpsc::Receiver<Envelope<FinalizeMessage>>,
    mut admin_rx: mpsc::Receiver<Envelope<crate::votes::AdminMessage>>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Consensus: loop started");
    let mut role_rx = consensus.role_rx.clone();
    let mut was_leader = role_rx.borrow().is_leader();
    let mut gc = interval(consensus.timing.recheck_interval);

    loop {
        tokio::select! {
            Some(envelope) = proposal_rx.recv() => {
                consensus.handle_proposal(envelope).await;
            }
            Some(envelope) = ack_rx.recv() => {
                consensus.handle_ack(envelope).await;
            }
            Some(envelope) = finalize_rx.recv() => {
                consensus.handle_finalized(envelope).await;
            }
            Some(envelope) = admin_rx.recv() => {
                consensus.handle_admin(envelope).await;
            }
            _ = gc.tick() => {
                consensus.expire_pending().await;
            }
            changed = role_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let is_leader = role_rx.borrow().is_leader();
                if is_leader && !was_leader {
                    info!("Consensus: gained leadership, reconciling pending proposals");
                    consensus.reconcile_pending().await;
                }
                was_leader = is_leader;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Consensus: loop stopped");
}
