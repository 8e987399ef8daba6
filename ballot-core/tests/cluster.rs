//! In-process cluster tests
//!
//! Several nodes share one `MemoryStore`, which gives them a common key
//! space and pub/sub fabric; timings are shrunk so elections and consensus
//! converge in milliseconds.

use ballot_core::config::{
    ClockTiming, ConsensusTiming, DirectoryTiming, ElectionTiming, NodeConfig,
};
use ballot_core::consensus::{SubmitError, VoteStatus};
use ballot_core::node::Node;
use ballot_core::store::{MemoryStore, SharedStore};
use ballot_core::types::{wall_clock, Ballot, Role};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn fast_config(node_id: &str, role: Role) -> NodeConfig {
    NodeConfig {
        node_id: node_id.to_string(),
        initial_role: role,
        directory: DirectoryTiming {
            heartbeat_interval: Duration::from_millis(25),
            heartbeat_ttl: Duration::from_millis(400),
            observe_interval: Duration::from_millis(25),
            liveness_window: 0.4,
            failure_threshold: 5,
        },
        election: ElectionTiming {
            timeout_min: Duration::from_millis(300),
            timeout_max: Duration::from_millis(600),
            heartbeat_interval: Duration::from_millis(100),
            check_interval: Duration::from_millis(25),
        },
        clock: ClockTiming {
            startup_interval: Duration::from_millis(50),
            steady_interval: Duration::from_millis(100),
            startup_phase: Duration::from_secs(60),
            history_size: 5,
            sync_max_age: Duration::from_secs(30),
            timestamp_tolerance: 5.0,
        },
        consensus: ConsensusTiming {
            initial_recheck: Duration::from_millis(25),
            recheck_interval: Duration::from_millis(50),
            pending_ttl: Duration::from_secs(5),
        },
        ..NodeConfig::default()
    }
}

async fn start_cluster(store: &Arc<MemoryStore>, specs: &[(&str, Role)]) -> Vec<Arc<Node>> {
    let mut nodes = Vec::new();
    for (node_id, role) in specs {
        let shared: Arc<dyn SharedStore> = store.clone();
        let node = Node::new(fast_config(node_id, *role), shared);
        node.start().await.expect("node start");
        nodes.push(node);
    }
    nodes
}

fn ballot(voter: &str, election: &str, candidate: &str) -> Ballot {
    Ballot {
        voter_id: voter.to_string(),
        election_id: election.to_string(),
        candidate_id: candidate.to_string(),
        timestamp: wall_clock(),
        signature: String::new(),
    }
}

async fn eventually<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn await_full_mesh(nodes: &[Arc<Node>]) {
    let expected = nodes.len() - 1;
    let nodes = nodes.to_vec();
    eventually("full peer mesh", Duration::from_secs(10), || {
        let nodes = nodes.clone();
        async move { nodes.iter().all(|n| n.peers().len() == expected) }
    })
    .await;
}

#[tokio::test]
async fn test_three_node_vote_finalizes_cluster_wide() {
    let store = Arc::new(MemoryStore::new());
    let nodes = start_cluster(
        &store,
        &[("a", Role::Leader), ("b", Role::Follower), ("c", Role::Follower)],
    )
    .await;
    await_full_mesh(&nodes).await;

    // Submit to a follower: it forwards to the leader
    let vote_id = nodes[1]
        .submit_vote(ballot("v1", "e1", "c1"))
        .await
        .expect("submission accepted");
    assert!(vote_id.starts_with("e1:v1:"));

    let all = nodes.clone();
    let id = vote_id.clone();
    eventually("finalization on every node", Duration::from_secs(10), || {
        let all = all.clone();
        let id = id.clone();
        async move {
            for node in &all {
                if !matches!(node.vote_status(&id).await, VoteStatus::Finalized(_)) {
                    return false;
                }
            }
            true
        }
    })
    .await;

    for node in &nodes {
        let tally = node.results("e1").await.unwrap();
        assert_eq!(tally.total_votes, 1);
        assert_eq!(tally.results["c1"], 1);
        // The in-memory recount agrees with the counter family
        assert_eq!(node.consensus().recount("e1").await["c1"], 1);
    }
}

#[tokio::test]
async fn test_duplicate_vote_rejected_on_any_node() {
    let store = Arc::new(MemoryStore::new());
    let nodes = start_cluster(
        &store,
        &[("a", Role::Leader), ("b", Role::Follower), ("c", Role::Follower)],
    )
    .await;
    await_full_mesh(&nodes).await;

    let vote_id = nodes[0]
        .submit_vote(ballot("v1", "e1", "c1"))
        .await
        .unwrap();

    let all = nodes.clone();
    eventually("finalization everywhere", Duration::from_secs(10), || {
        let all = all.clone();
        let id = vote_id.clone();
        async move {
            for node in &all {
                if !matches!(node.vote_status(&id).await, VoteStatus::Finalized(_)) {
                    return false;
                }
            }
            true
        }
    })
    .await;

    // Every node refuses the second attempt, whichever receives it
    for node in &nodes {
        let result = node.submit_vote(ballot("v1", "e1", "c2")).await;
        assert!(
            matches!(result, Err(SubmitError::AlreadyVoted)),
            "duplicate accepted on {}",
            node.node_id()
        );
    }
}

#[tokio::test]
async fn test_concurrent_conflicting_votes_count_once() {
    let store = Arc::new(MemoryStore::new());
    let nodes = start_cluster(
        &store,
        &[("a", Role::Leader), ("b", Role::Follower), ("c", Role::Follower)],
    )
    .await;
    await_full_mesh(&nodes).await;

    // The same voter races two different candidates on two nodes
    let (first, second) = tokio::join!(
        nodes[0].submit_vote(ballot("v2", "e1", "c1")),
        nodes[2].submit_vote(ballot("v2", "e1", "c2")),
    );
    assert!(first.is_ok() || second.is_ok());

    let leader = nodes[0].clone();
    eventually("exactly one increment", Duration::from_secs(10), || {
        let leader = leader.clone();
        async move {
            leader
                .results("e1")
                .await
                .map(|tally| tally.total_votes == 1)
                .unwrap_or(false)
        }
    })
    .await;

    // Quiescence: the count stays at one
    tokio::time::sleep(Duration::from_millis(300)).await;
    let tally = nodes[0].results("e1").await.unwrap();
    assert_eq!(tally.total_votes, 1);
}

#[tokio::test]
async fn test_leader_failover_elects_new_leader() {
    let store = Arc::new(MemoryStore::new());
    let nodes = start_cluster(
        &store,
        &[("a", Role::Leader), ("b", Role::Follower), ("c", Role::Follower)],
    )
    .await;
    await_full_mesh(&nodes).await;
    let old_term = nodes[0].role_view().term;

    nodes[0].shutdown().await;

    let survivors = vec![nodes[1].clone(), nodes[2].clone()];
    eventually("a single new leader", Duration::from_secs(15), || {
        let survivors = survivors.clone();
        async move {
            let views: Vec<_> = survivors.iter().map(|n| n.role_view()).collect();
            let leaders = views.iter().filter(|v| v.role == Role::Leader).count();
            let followers = views.iter().filter(|v| v.role == Role::Follower).count();
            leaders == 1 && followers == 1
        }
    })
    .await;

    let new_leader = survivors
        .iter()
        .find(|n| n.role_view().role == Role::Leader)
        .unwrap();
    assert!(new_leader.role_view().term > old_term);

    // The survivors still form a quorum: votes finalize
    let vote_id = new_leader
        .submit_vote(ballot("v9", "e9", "c1"))
        .await
        .unwrap();
    let check = new_leader.clone();
    eventually("post-failover finalization", Duration::from_secs(10), || {
        let check = check.clone();
        let id = vote_id.clone();
        async move { matches!(check.vote_status(&id).await, VoteStatus::Finalized(_)) }
    })
    .await;
}

#[tokio::test]
async fn test_reset_propagates_to_all_nodes() {
    let store = Arc::new(MemoryStore::new());
    let nodes = start_cluster(
        &store,
        &[("a", Role::Leader), ("b", Role::Follower), ("c", Role::Follower)],
    )
    .await;
    await_full_mesh(&nodes).await;

    let vote_id = nodes[0]
        .submit_vote(ballot("v1", "e1", "c1"))
        .await
        .unwrap();
    let all = nodes.clone();
    eventually("finalization everywhere", Duration::from_secs(10), || {
        let all = all.clone();
        let id = vote_id.clone();
        async move {
            for node in &all {
                if !matches!(node.vote_status(&id).await, VoteStatus::Finalized(_)) {
                    return false;
                }
            }
            true
        }
    })
    .await;

    let report = nodes[1].reset_election("e1").await.unwrap();
    assert!(report.complete());

    let all = nodes.clone();
    eventually("zero tallies everywhere", Duration::from_secs(10), || {
        let all = all.clone();
        async move {
            for node in &all {
                match node.results("e1").await {
                    Ok(tally) if tally.total_votes == 0 => {}
                    _ => return false,
                }
                if !node.consensus().recount("e1").await.is_empty() {
                    return false;
                }
            }
            true
        }
    })
    .await;

    // The voter may vote again after the reset
    let again = nodes[2].submit_vote(ballot("v1", "e1", "c2")).await;
    assert!(again.is_ok());
}

#[tokio::test]
async fn test_single_node_cluster_finalizes_immediately() {
    let store = Arc::new(MemoryStore::new());
    let nodes = start_cluster(&store, &[("solo", Role::Leader)]).await;

    assert_eq!(nodes[0].role_view().role, Role::Leader);

    let vote_id = nodes[0]
        .submit_vote(ballot("v1", "e1", "c1"))
        .await
        .unwrap();
    let solo = nodes[0].clone();
    eventually("solo finalization", Duration::from_secs(5), || {
        let solo = solo.clone();
        let id = vote_id.clone();
        async move { matches!(solo.vote_status(&id).await, VoteStatus::Finalized(_)) }
    })
    .await;

    let solo = nodes[0].clone();
    eventually("healthy report", Duration::from_secs(5), || {
        let solo = solo.clone();
        async move { solo.health_report().await.healthy }
    })
    .await;
    let report = nodes[0].health_report().await;
    assert_eq!(report.votes_processed, 1);
    assert!(report.clock_sync.synced);
}

#[tokio::test]
async fn test_timestamp_tolerance_boundary() {
    let store = Arc::new(MemoryStore::new());
    let nodes = start_cluster(&store, &[("solo", Role::Leader)]).await;

    let mut near_future = ballot("v1", "e1", "c1");
    near_future.timestamp = wall_clock() + 4.5;
    assert!(nodes[0].submit_vote(near_future).await.is_ok());

    // Exactly at the tolerance edge is accepted
    let mut at_edge = ballot("v2", "e1", "c1");
    at_edge.timestamp = wall_clock() + 5.0;
    assert!(nodes[0].submit_vote(at_edge).await.is_ok());

    // Just past the edge is rejected
    let mut past_edge = ballot("v3", "e1", "c1");
    past_edge.timestamp = wall_clock() + 5.001;
    assert!(matches!(
        nodes[0].submit_vote(past_edge).await,
        Err(SubmitError::Invalid(_))
    ));

    let mut far_future = ballot("v4", "e1", "c1");
    far_future.timestamp = wall_clock() + 5.5;
    assert!(matches!(
        nodes[0].submit_vote(far_future).await,
        Err(SubmitError::Invalid(_))
    ));
}

#[tokio::test]
async fn test_followers_report_synced_clock() {
    let store = Arc::new(MemoryStore::new());
    let nodes = start_cluster(
        &store,
        &[("a", Role::Leader), ("b", Role::Follower), ("c", Role::Follower)],
    )
    .await;

    let followers = vec![nodes[1].clone(), nodes[2].clone()];
    eventually("followers synced", Duration::from_secs(10), || {
        let followers = followers.clone();
        async move {
            followers
                .iter()
                .all(|n| n.clock().status(false).synced)
        }
    })
    .await;

    // Co-resident nodes share a wall clock, so offsets stay negligible
    for node in &followers {
        assert!(node.clock().offset().abs() < 0.5);
    }
}
