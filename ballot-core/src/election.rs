//! Raft-style leader election
//!
//! Single role per term over the broadcast bus:
//! - State machine: Follower → Candidate → Leader
//! - Randomized election timeout (5-10s) against split votes
//! - Term-numbered, single-shot votes
//! - Periodic leader heartbeat; followers election on heartbeat silence
//!
//! The bus gives at-most-once, unordered delivery; lost messages delay
//! convergence but never produce two leaders in one term.

use crate::bus::{Channel, Communicator, Envelope};
use crate::config::ElectionTiming;
use crate::directory::PeerSet;
use crate::types::{wall_clock, NodeId, Role, RoleView};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Messages on the `leader_election` channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ElectionMessage {
    /// Candidate requesting votes for a term
    #[serde(rename = "request_vote")]
    RequestVote {
        term: u64,
        candidate_id: NodeId,
        timestamp: f64,
    },

    /// Response to a vote request
    #[serde(rename = "vote_response")]
    VoteResponse {
        term: u64,
        vote_granted: bool,
        candidate_id: NodeId,
    },

    /// Periodic proof of leadership
    #[serde(rename = "leader_heartbeat")]
    LeaderHeartbeat {
        term: u64,
        leader_id: NodeId,
        timestamp: f64,
    },
}

impl ElectionMessage {
    /// Term carried by any election message
    pub fn term(&self) -> u64 {
        match self {
            ElectionMessage::RequestVote { term, .. } => *term,
            ElectionMessage::VoteResponse { term, .. } => *term,
            ElectionMessage::LeaderHeartbeat { term, .. } => *term,
        }
    }
}

/// Leader election state machine
pub struct Election {
    node_id: NodeId,
    timing: ElectionTiming,
    /// Current term (monotonically increasing)
    term: u64,
    /// Node voted for in the current term
    voted_for: Option<NodeId>,
    role: Role,
    leader_id: Option<NodeId>,
    /// Grants received while candidate
    votes_received: HashSet<NodeId>,
    /// Last heartbeat (or other leader contact) observed
    last_heartbeat: Instant,
    election_timeout: Duration,
    role_tx: watch::Sender<RoleView>,
}

impl Election {
    pub fn new(
        node_id: NodeId,
        timing: ElectionTiming,
        initial_role: Role,
        role_tx: watch::Sender<RoleView>,
    ) -> Self {
        let election_timeout = random_timeout(&timing);
        let role = match initial_role {
            // A candidate hint makes no sense at startup
            Role::Candidate => Role::Follower,
            other => other,
        };
        let election = Self {
            leader_id: (role == Role::Leader).then(|| node_id.clone()),
            node_id,
            timing,
            term: 0,
            voted_for: None,
            role,
            votes_received: HashSet::new(),
            last_heartbeat: Instant::now(),
            election_timeout,
            role_tx,
        };
        info!(
            "Election: node {} initialized as {} for term {}",
            election.node_id, election.role, election.term
        );
        election.publish_view();
        election
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn leader(&self) -> Option<&NodeId> {
        self.leader_id.as_ref()
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn timing(&self) -> &ElectionTiming {
        &self.timing
    }

    fn publish_view(&self) {
        let next = RoleView {
            role: self.role,
            term: self.term,
            leader: self.leader_id.clone(),
        };
        self.role_tx.send_if_modified(|view| {
            if *view != next {
                *view = next;
                true
            } else {
                false
            }
        });
    }

    fn reset_deadline(&mut self) {
        self.last_heartbeat = Instant::now();
        self.election_timeout = random_timeout(&self.timing);
    }

    /// Timeout check; returns a message to broadcast when an election starts.
    pub fn tick(&mut self, peer_count: usize) -> Option<ElectionMessage> {
        if self.role == Role::Leader {
            return None;
        }
        if self.last_heartbeat.elapsed() > self.election_timeout {
            warn!(
                "Election: no leader heartbeat for {:.1}s, starting election",
                self.last_heartbeat.elapsed().as_secs_f64()
            );
            return Some(self.start_election(peer_count));
        }
        None
    }

    /// Become candidate and solicit votes; a lone node wins on the spot.
    fn start_election(&mut self, peer_count: usize) -> ElectionMessage {
        self.term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.node_id.clone());
        self.votes_received.clear();
        self.votes_received.insert(self.node_id.clone());
        self.leader_id = None;
        self.reset_deadline();

        info!("Election: starting election for term {}", self.term);
        self.publish_view();

        if self.votes_received.len() >= votes_needed(peer_count) {
            return self.become_leader();
        }

        ElectionMessage::RequestVote {
            term: self.term,
            candidate_id: self.node_id.clone(),
            timestamp: wall_clock(),
        }
    }

    /// Leader's periodic heartbeat
    pub fn heartbeat(&self) -> Option<ElectionMessage> {
        if self.role != Role::Leader {
            return None;
        }
        Some(ElectionMessage::LeaderHeartbeat {
            term: self.term,
            leader_id: self.node_id.clone(),
            timestamp: wall_clock(),
        })
    }

    /// Handle an inbound election message; returns a response to broadcast.
    pub fn handle_message(
        &mut self,
        sender: &NodeId,
        message: ElectionMessage,
        peer_count: usize,
    ) -> Option<ElectionMessage> {
        // Any higher term demotes us before the message is processed
        if message.term() > self.term {
            info!(
                "Election: higher term {} from {} (local {}), stepping down",
                message.term(),
                sender,
                self.term
            );
            self.step_down(message.term());
        }

        match message {
            ElectionMessage::RequestVote {
                term, candidate_id, ..
            } => Some(self.handle_request_vote(term, candidate_id)),
            ElectionMessage::VoteResponse {
                term,
                vote_granted,
                candidate_id,
            } => {
                self.handle_vote_response(sender, term, vote_granted, candidate_id, peer_count)
            }
            ElectionMessage::LeaderHeartbeat { term, leader_id, .. } => {
                self.handle_heartbeat(term, leader_id);
                None
            }
        }
    }

    fn handle_request_vote(&mut self, term: u64, candidate_id: NodeId) -> ElectionMessage {
        let current = term >= self.term;
        let unvoted =
            self.voted_for.is_none() || self.voted_for.as_ref() == Some(&candidate_id);
        let grant = current && unvoted;

        if grant {
            self.voted_for = Some(candidate_id.clone());
            self.reset_deadline();
            info!(
                "Election: granting vote to {} for term {}",
                candidate_id, term
            );
        } else {
            info!(
                "Election: rejecting vote for {} (term {}, already voted for {:?})",
                candidate_id, term, self.voted_for
            );
        }

        ElectionMessage::VoteResponse {
            term: self.term,
            vote_granted: grant,
            candidate_id,
        }
    }

    fn handle_vote_response(
        &mut self,
        sender: &NodeId,
        term: u64,
        vote_granted: bool,
        candidate_id: NodeId,
        peer_count: usize,
    ) -> Option<ElectionMessage> {
        if self.role != Role::Candidate
            || term != self.term
            || candidate_id != self.node_id
            || !vote_granted
        {
            return None;
        }

        self.votes_received.insert(sender.clone());
        info!(
            "Election: vote from {} ({}/{} needed)",
            sender,
            self.votes_received.len(),
            votes_needed(peer_count)
        );

        if self.votes_received.len() >= votes_needed(peer_count) {
            return Some(self.become_leader());
        }
        None
    }

    fn handle_heartbeat(&mut self, term: u64, leader_id: NodeId) {
        if term < self.term {
            debug!(
                "Election: ignoring stale heartbeat from {} (term {})",
                leader_id, term
            );
            return;
        }

        self.last_heartbeat = Instant::now();
        self.election_timeout = random_timeout(&self.timing);

        if self.leader_id.as_ref() != Some(&leader_id) {
            info!(
                "Election: recognizing {} as leader for term {}",
                leader_id, term
            );
        }
        self.leader_id = Some(leader_id);

        if self.role != Role::Follower {
            self.step_down(term);
        } else {
            self.publish_view();
        }
    }

    /// Won the election: immediate heartbeat asserts authority.
    fn become_leader(&mut self) -> ElectionMessage {
        info!(
            "Election: node {} won term {} with {} votes",
            self.node_id,
            self.term,
            self.votes_received.len()
        );
        self.role = Role::Leader;
        self.leader_id = Some(self.node_id.clone());
        self.publish_view();

        ElectionMessage::LeaderHeartbeat {
            term: self.term,
            leader_id: self.node_id.clone(),
            timestamp: wall_clock(),
        }
    }

    /// Drop to follower. The vote is cleared only when the term advances, so
    /// a node never votes twice within one term.
    fn step_down(&mut self, new_term: u64) {
        let old_role = self.role;
        if new_term > self.term {
            self.term = new_term;
            self.voted_for = None;
        }
        self.role = Role::Follower;
        self.votes_received.clear();
        self.reset_deadline();

        if old_role != Role::Follower {
            info!(
                "Election: stepped down from {} to follower (term {})",
                old_role, self.term
            );
        }
        self.publish_view();
    }
}

/// Quorum size: ⌊N/2⌋+1 where N = known peers + self
fn votes_needed(peer_count: usize) -> usize {
    (peer_count + 1) / 2 + 1
}

fn random_timeout(timing: &ElectionTiming) -> Duration {
    use rand::Rng;
    let min = timing.timeout_min.as_millis() as u64;
    let max = timing.timeout_max.as_millis() as u64;
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(min..=max))
}

/// Election background task: 0.5s timeout ticks, 2s leader heartbeats, and
/// inbound message handling, all against the live peer count.
pub async fn run_election_loop(
    election: Arc<RwLock<Election>>,
    com: Communicator,
    peers_rx: watch::Receiver<PeerSet>,
    mut rx: mpsc::Receiver<Envelope<ElectionMessage>>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Election: loop started");
    let (check_interval, heartbeat_interval) = {
        let el = election.read().await;
        (el.timing.check_interval, el.timing.heartbeat_interval)
    };
    let mut ticker = interval(check_interval);
    // Fire the first leader heartbeat immediately
    let mut last_heartbeat_sent = Instant::now() - heartbeat_interval;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let peer_count = peers_rx.borrow().len();
                let outbound = {
                    let mut el = election.write().await;
                    if let Some(message) = el.tick(peer_count) {
                        Some(message)
                    } else if el.is_leader()
                        && last_heartbeat_sent.elapsed() >= heartbeat_interval
                    {
                        last_heartbeat_sent = Instant::now();
                        el.heartbeat()
                    } else {
                        None
                    }
                };
                if let Some(message) = outbound {
                    if let Err(err) = com.broadcast(Channel::LeaderElection, &message).await {
                        warn!("Election: broadcast failed: {}", err);
                    }
                }
            }

            envelope = rx.recv() => {
                let Some(envelope) = envelope else { break };
                let peer_count = peers_rx.borrow().len();
                let response = {
                    let mut el = election.write().await;
                    el.handle_message(&envelope.sender, envelope.payload, peer_count)
                };
                if let Some(message) = response {
                    if let Err(err) = com.broadcast(Channel::LeaderElection, &message).await {
                        warn!("Election: response broadcast failed: {}", err);
                    }
                }
            }

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Election: loop stopped");
}
