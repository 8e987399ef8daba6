//! Per-node assembly
//!
//! `Node` builds every subsystem with explicit capabilities (store handle,
//! bus, clock, role and peer watches) and owns the task set plus the
//! watch-based shutdown signal. Nothing here is global; two nodes can share
//! one process and one `MemoryStore`, which is exactly how the integration
//! tests run a cluster.

use crate::bus::{Channel, Communicator};
use crate::clock::{self, ClockSync, SyncStatus};
use crate::config::NodeConfig;
use crate::consensus::{
    run_consensus_loop, Consensus, SubmitError, VoteStatus,
};
use crate::directory::{
    run_heartbeat_loop, run_observer_loop, Directory, Health, PeerSet,
};
use crate::election::{run_election_loop, Election};
use crate::mutex::{DistributedMutex, MutexError};
use crate::store::{SharedStore, StoreResult};
use crate::types::{Ballot, NodeId, Role, RoleView, VoteId};
use crate::votes::{ResetReport, Tally};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const MESSAGE_QUEUE_DEPTH: usize = 64;

/// Aggregated liveness for the HTTP boundary
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(skip)]
    pub healthy: bool,
    pub node_id: NodeId,
    pub role: Role,
    pub connected_nodes: Vec<NodeId>,
    pub votes_processed: u64,
    pub system_time: f64,
    pub uptime: f64,
    pub shared_store: StoreHealth,
    pub clock_sync: SyncStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub state: String,
    pub size: usize,
}

/// One voting-cluster node
pub struct Node {
    config: NodeConfig,
    store: Arc<dyn SharedStore>,
    com: Communicator,
    directory: Arc<Directory>,
    health: Arc<Health>,
    clock: Arc<ClockSync>,
    election: Arc<RwLock<Election>>,
    consensus: Arc<Consensus>,
    role_rx: watch::Receiver<RoleView>,
    peers_rx: watch::Receiver<PeerSet>,
    shutdown_tx: watch::Sender<bool>,
    started_at: Instant,
}

impl Node {
    pub fn new(config: NodeConfig, store: Arc<dyn SharedStore>) -> Arc<Self> {
        let node_id = config.node_id.clone();
        let com = Communicator::new(store.clone(), node_id.clone());
        let health = Arc::new(Health::new());
        let (directory, peers_rx) = Directory::new(
            store.clone(),
            node_id.clone(),
            config.directory.clone(),
            health.clone(),
        );

        let (role_tx, role_rx) =
            watch::channel(RoleView::initial(config.initial_role, &node_id));
        let election = Arc::new(RwLock::new(Election::new(
            node_id.clone(),
            config.election.clone(),
            config.initial_role,
            role_tx,
        )));

        let clock = Arc::new(ClockSync::new(
            node_id.clone(),
            config.clock.clone(),
            config.initial_role == Role::Leader,
        ));

        let consensus = Consensus::new(
            node_id,
            config.consensus.clone(),
            store.clone(),
            com.clone(),
            clock.clone(),
            directory.clone(),
            role_rx.clone(),
            peers_rx.clone(),
        );

        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            config,
            store,
            com,
            directory,
            health,
            clock,
            election,
            consensus,
            role_rx,
            peers_rx,
            shutdown_tx,
            started_at: Instant::now(),
        })
    }

    /// Register in the directory and spawn the full task set.
    pub async fn start(&self) -> StoreResult<Vec<JoinHandle<()>>> {
        self.directory.register(self.config.initial_role).await?;

        let shutdown = self.shutdown_tx.subscribe();
        let mut handles = Vec::new();

        let (election_tx, election_rx) = mpsc::channel(MESSAGE_QUEUE_DEPTH);
        handles.push(
            self.com
                .listen(Channel::LeaderElection, election_tx, shutdown.clone())
                .await?,
        );
        let (time_tx, time_rx) = mpsc::channel(MESSAGE_QUEUE_DEPTH);
        handles.push(
            self.com
                .listen(Channel::TimeSync, time_tx, shutdown.clone())
                .await?,
        );
        let (proposal_tx, proposal_rx) = mpsc::channel(MESSAGE_QUEUE_DEPTH);
        handles.push(
            self.com
                .listen(Channel::VoteProposal, proposal_tx, shutdown.clone())
                .await?,
        );
        let (ack_tx, ack_rx) = mpsc::channel(MESSAGE_QUEUE_DEPTH);
        handles.push(
            self.com
                .listen(Channel::VoteResponse, ack_tx, shutdown.clone())
                .await?,
        );
        let (finalize_tx, finalize_rx) = mpsc::channel(MESSAGE_QUEUE_DEPTH);
        handles.push(
            self.com
                .listen(Channel::VoteFinalization, finalize_tx, shutdown.clone())
                .await?,
        );
        let (admin_tx, admin_rx) = mpsc::channel(MESSAGE_QUEUE_DEPTH);
        handles.push(
            self.com
                .listen(Channel::ElectionAdmin, admin_tx, shutdown.clone())
                .await?,
        );

        handles.push(tokio::spawn(run_heartbeat_loop(
            self.directory.clone(),
            self.role_rx.clone(),
            shutdown.clone(),
        )));
        handles.push(tokio::spawn(run_observer_loop(
            self.directory.clone(),
            shutdown.clone(),
        )));
        handles.push(tokio::spawn(run_election_loop(
            self.election.clone(),
            self.com.clone(),
            self.peers_rx.clone(),
            election_rx,
            shutdown.clone(),
        )));
        handles.push(tokio::spawn(clock::run_broadcast_loop(
            self.clock.clone(),
            self.com.clone(),
            self.store.clone(),
            self.role_rx.clone(),
            shutdown.clone(),
        )));
        handles.push(tokio::spawn(clock::run_sync_loop(
            self.clock.clone(),
            self.com.clone(),
            self.store.clone(),
            self.role_rx.clone(),
            time_rx,
            shutdown.clone(),
        )));
        handles.push(tokio::spawn(run_consensus_loop(
            self.consensus.clone(),
            proposal_rx,
            ack_rx,
            finalize_rx,
            admin_rx,
            shutdown,
        )));

        info!(
            "Node: {} started with {} background tasks",
            self.config.node_id,
            handles.len()
        );
        Ok(handles)
    }

    /// Stop every loop, mark the directory entry and close subscribers.
    pub async fn shutdown(&self) {
        info!("Node: {} shutting down", self.config.node_id);
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.directory.mark_shutdown().await {
            warn!("Node: could not mark shutdown in directory: {}", err);
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn role_view(&self) -> RoleView {
        self.role_rx.borrow().clone()
    }

    pub fn peers(&self) -> PeerSet {
        self.peers_rx.borrow().clone()
    }

    pub fn clock(&self) -> &Arc<ClockSync> {
        &self.clock
    }

    pub fn consensus(&self) -> &Arc<Consensus> {
        &self.consensus
    }

    pub async fn submit_vote(&self, ballot: Ballot) -> Result<VoteId, SubmitError> {
        self.consensus.submit(ballot).await
    }

    pub async fn vote_status(&self, vote_id: &VoteId) -> VoteStatus {
        self.consensus.vote_status(vote_id).await
    }

    pub async fn results(&self, election_id: &str) -> StoreResult<Tally> {
        self.consensus.vote_store().tally(election_id).await
    }

    /// Admin reset: serialize cluster-wide resets of one election through
    /// the distributed mutex, clear the store and the local mirrors, and
    /// tell peers to clear theirs.
    pub async fn reset_election(&self, election_id: &str) -> Result<ResetReport, MutexError> {
        let mut lock = DistributedMutex::new(
            self.store.clone(),
            &format!("reset:{}", election_id),
            &self.config.node_id,
            Duration::from_secs(30),
        );

        let outcome = lock
            .locked(Duration::from_secs(10), Duration::from_millis(200), async {
                let report = self
                    .consensus
                    .vote_store()
                    .reset_election(election_id)
                    .await?;
                self.consensus.clear_election(election_id).await;
                self.consensus
                    .vote_store()
                    .broadcast_reset(&self.com, election_id)
                    .await?;
                Ok::<ResetReport, crate::store::StoreError>(report)
            })
            .await?;

        outcome.map_err(MutexError::Store)
    }

    /// Aggregate liveness: local health machine plus a live store ping.
    pub async fn health_report(&self) -> HealthReport {
        let store_alive = self.store.ping().await.is_ok();
        let store_state = match self.store.info().await {
            Ok(info) => info.state,
            Err(err) => format!("error: {}", err),
        };
        let store_size = self.store.size().await.unwrap_or(0);

        let view = self.role_view();
        let healthy = self.health.is_healthy() && store_alive;

        HealthReport {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            healthy,
            node_id: self.config.node_id.clone(),
            role: view.role,
            connected_nodes: self.peers_rx.borrow().iter().cloned().collect(),
            votes_processed: self.consensus.votes_processed(),
            system_time: self.clock.corrected_now(),
            uptime: self.started_at.elapsed().as_secs_f64(),
            shared_store: StoreHealth {
                state: store_state,
                size: store_size,
            },
            clock_sync: self.clock.status(view.is_leader()),
        }
    }
}
