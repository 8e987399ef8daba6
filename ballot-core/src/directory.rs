//! Node directory
//!
//! Each node owns one hash entry under the `{nodes}` family, refreshed with
//! a TTL so a crashed node disappears on its own. An observer scan builds
//! the live peer set every cycle and publishes it on a watch channel; the
//! health machine degrades the node after repeated refresh failures.

use crate::config::DirectoryTiming;
use crate::store::{keys, SharedStore, StoreResult};
use crate::types::{wall_clock, NodeId, NodeStatus, Role, RoleView};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Live peers as observed by the directory scan (self excluded)
pub type PeerSet = HashSet<NodeId>;

/// Node lifecycle: `starting → active → (degraded) → shutdown`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthPhase {
    Starting,
    Active,
    Degraded,
    Shutdown,
}

impl std::fmt::Display for HealthPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthPhase::Starting => write!(f, "starting"),
            HealthPhase::Active => write!(f, "active"),
            HealthPhase::Degraded => write!(f, "degraded"),
            HealthPhase::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Shared health state. A node is healthy once its heartbeat refresh
/// succeeds and the observer has completed at least one full scan.
pub struct Health {
    phase: Mutex<HealthPhase>,
    refreshes: AtomicU64,
    scans: AtomicU64,
    consecutive_failures: AtomicU32,
}

impl Health {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(HealthPhase::Starting),
            refreshes: AtomicU64::new(0),
            scans: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn phase(&self) -> HealthPhase {
        *self.phase.lock().unwrap()
    }

    pub fn is_healthy(&self) -> bool {
        self.phase() == HealthPhase::Active
    }

    pub fn mark_shutdown(&self) {
        *self.phase.lock().unwrap() = HealthPhase::Shutdown;
    }

    fn record_refresh_ok(&self) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.maybe_activate();
    }

    fn record_refresh_failure(&self, threshold: u32) -> u32 {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= threshold {
            let mut phase = self.phase.lock().unwrap();
            if *phase == HealthPhase::Active || *phase == HealthPhase::Starting {
                *phase = HealthPhase::Degraded;
            }
        }
        failures
    }

    fn record_scan_ok(&self) {
        self.scans.fetch_add(1, Ordering::Relaxed);
        self.maybe_activate();
    }

    /// Promote to active once both loops have made progress and nothing is
    /// currently failing.
    fn maybe_activate(&self) {
        if self.refreshes.load(Ordering::Relaxed) > 0
            && self.scans.load(Ordering::Relaxed) > 0
            && self.consecutive_failures.load(Ordering::Relaxed) == 0
        {
            let mut phase = self.phase.lock().unwrap();
            if *phase == HealthPhase::Starting || *phase == HealthPhase::Degraded {
                *phase = HealthPhase::Active;
            }
        }
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's directory record
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub node_id: NodeId,
    pub role: Role,
    pub status: NodeStatus,
    pub start_time: f64,
    pub last_heartbeat: Option<f64>,
    pub host: String,
}

impl NodeEntry {
    fn from_fields(node_id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            node_id: node_id.to_string(),
            role: fields.get("role")?.parse().ok()?,
            status: match fields.get("status").map(String::as_str) {
                Some("shutdown") => NodeStatus::Shutdown,
                _ => NodeStatus::Active,
            },
            start_time: fields
                .get("start_time")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            last_heartbeat: fields.get("last_heartbeat").and_then(|v| v.parse().ok()),
            host: fields.get("host").cloned().unwrap_or_default(),
        })
    }
}

/// The directory service for one node
pub struct Directory {
    store: Arc<dyn SharedStore>,
    node_id: NodeId,
    timing: DirectoryTiming,
    health: Arc<Health>,
    peers_tx: watch::Sender<PeerSet>,
}

impl Directory {
    pub fn new(
        store: Arc<dyn SharedStore>,
        node_id: NodeId,
        timing: DirectoryTiming,
        health: Arc<Health>,
    ) -> (Arc<Self>, watch::Receiver<PeerSet>) {
        let (peers_tx, peers_rx) = watch::channel(PeerSet::new());
        (
            Arc::new(Self {
                store,
                node_id,
                timing,
                health,
                peers_tx,
            }),
            peers_rx,
        )
    }

    /// Write this node's registry entry.
    pub async fn register(&self, role: Role) -> StoreResult<()> {
        let key = keys::node(&self.node_id);
        let fields = vec![
            ("node_id".to_string(), self.node_id.clone()),
            ("role".to_string(), role.to_string()),
            ("status".to_string(), NodeStatus::Active.to_string()),
            ("start_time".to_string(), wall_clock().to_string()),
            (
                "host".to_string(),
                std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            ),
        ];
        self.store.hash_set(&key, &fields).await?;
        self.store.expire(&key, self.timing.heartbeat_ttl).await?;
        info!("Directory: registered {} as {}", self.node_id, role);
        Ok(())
    }

    /// Refresh the heartbeat fields and re-arm the TTL.
    async fn refresh(&self, role: Role) -> StoreResult<()> {
        let key = keys::node(&self.node_id);
        let fields = vec![
            ("last_heartbeat".to_string(), wall_clock().to_string()),
            ("status".to_string(), NodeStatus::Active.to_string()),
            ("role".to_string(), role.to_string()),
        ];
        self.store.hash_set(&key, &fields).await?;
        self.store.expire(&key, self.timing.heartbeat_ttl).await?;
        Ok(())
    }

    /// Mark the entry shutdown with a short expiry so peers observe it.
    pub async fn mark_shutdown(&self) -> StoreResult<()> {
        self.health.mark_shutdown();
        let key = keys::node(&self.node_id);
        let fields = vec![("status".to_string(), NodeStatus::Shutdown.to_string())];
        self.store.hash_set(&key, &fields).await?;
        self.store
            .expire(&key, std::time::Duration::from_secs(5))
            .await?;
        Ok(())
    }

    /// Scan the directory and collect peers with a recent heartbeat.
    pub async fn observe(&self) -> StoreResult<PeerSet> {
        let now = wall_clock();
        let mut active = PeerSet::new();
        let mut registered = 0usize;

        for key in self.store.scan(&keys::node_pattern()).await? {
            let Some(node_id) = keys::node_id_of(&key) else {
                continue;
            };
            if node_id == self.node_id {
                continue;
            }
            registered += 1;

            let fields = self.store.hash_get_all(&key).await?;
            let Some(entry) = NodeEntry::from_fields(node_id, &fields) else {
                continue;
            };
            if entry.status == NodeStatus::Shutdown {
                continue;
            }

            let age = entry.last_heartbeat.map(|hb| now - hb);
            match age {
                Some(age) if age < self.timing.liveness_window => {
                    debug!(
                        "Directory: node {} active, heartbeat {:.1}s ago",
                        node_id, age
                    );
                    active.insert(node_id.to_string());
                }
                Some(age) => {
                    warn!(
                        "Directory: node {} inactive, heartbeat {:.1}s ago",
                        node_id, age
                    );
                }
                // Registered but never refreshed yet
                None => {}
            }
        }

        let changed = *self.peers_tx.borrow() != active;
        if changed {
            info!("Directory: active peers changed: {:?}", active);
        }
        self.peers_tx.send_replace(active.clone());
        debug!(
            "Directory: {} active of {} registered peers",
            active.len(),
            registered
        );
        Ok(active)
    }

    /// Find the node currently registered as an active leader.
    pub async fn find_leader(&self) -> StoreResult<Option<NodeId>> {
        for key in self.store.scan(&keys::node_pattern()).await? {
            let Some(node_id) = keys::node_id_of(&key) else {
                continue;
            };
            let fields = self.store.hash_get_all(&key).await?;
            if let Some(entry) = NodeEntry::from_fields(node_id, &fields) {
                if entry.role == Role::Leader && entry.status == NodeStatus::Active {
                    return Ok(Some(entry.node_id));
                }
            }
        }
        Ok(None)
    }

    pub fn health(&self) -> &Arc<Health> {
        &self.health
    }
}

/// Heartbeat refresh loop: refresh every cycle, degrade after repeated
/// failures, recover on the next success.
pub async fn run_heartbeat_loop(
    directory: Arc<Directory>,
    role_rx: watch::Receiver<RoleView>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Directory: heartbeat loop started");
    let interval = directory.timing.heartbeat_interval;
    let threshold = directory.timing.failure_threshold;
    let mut had_failures = 0u32;

    loop {
        let role = role_rx.borrow().role;
        let sleep = match directory.refresh(role).await {
            Ok(()) => {
                if had_failures > 0 {
                    info!(
                        "Directory: heartbeat restored after {} failures",
                        had_failures
                    );
                    had_failures = 0;
                }
                directory.health.record_refresh_ok();
                interval
            }
            Err(err) => {
                had_failures = directory.health.record_refresh_failure(threshold);
                error!(
                    "Directory: heartbeat refresh failed (attempt {}): {}",
                    had_failures, err
                );
                if had_failures >= threshold {
                    error!("Directory: heartbeat failing repeatedly, node degraded");
                }
                interval * 2
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Directory: heartbeat loop stopped");
}

/// Peer observer loop: rebuild the live peer set every cycle.
pub async fn run_observer_loop(directory: Arc<Directory>, mut shutdown: watch::Receiver<bool>) {
    info!("Directory: observer loop started");
    let interval = directory.timing.observe_interval;

    loop {
        match directory.observe().await {
            Ok(_) => directory.health.record_scan_ok(),
            Err(err) => error!("Directory: observer scan failed: {}", err),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Directory: observer loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn timing() -> DirectoryTiming {
        DirectoryTiming {
            heartbeat_interval: Duration::from_millis(20),
            heartbeat_ttl: Duration::from_millis(200),
            observe_interval: Duration::from_millis(20),
            liveness_window: 0.2,
            failure_threshold: 5,
        }
    }

    #[tokio::test]
    async fn test_register_and_find_leader() {
        let store = Arc::new(MemoryStore::new());
        let (dir_a, _) = Directory::new(
            store.clone(),
            "a".to_string(),
            timing(),
            Arc::new(Health::new()),
        );
        let (dir_b, _) = Directory::new(
            store.clone(),
            "b".to_string(),
            timing(),
            Arc::new(Health::new()),
        );

        dir_a.register(Role::Leader).await.unwrap();
        dir_b.register(Role::Follower).await.unwrap();

        assert_eq!(dir_b.find_leader().await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_observe_requires_recent_heartbeat() {
        let store = Arc::new(MemoryStore::new());
        let (dir_a, _) = Directory::new(
            store.clone(),
            "a".to_string(),
            timing(),
            Arc::new(Health::new()),
        );
        let (dir_b, _) = Directory::new(
            store.clone(),
            "b".to_string(),
            timing(),
            Arc::new(Health::new()),
        );

        dir_a.register(Role::Follower).await.unwrap();
        dir_b.register(Role::Follower).await.unwrap();

        // Registered but never refreshed: not yet active
        assert!(dir_a.observe().await.unwrap().is_empty());

        dir_b.refresh(Role::Follower).await.unwrap();
        let peers = dir_a.observe().await.unwrap();
        assert!(peers.contains("b"));

        // Heartbeat ages out of the liveness window
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(dir_a.observe().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_entry_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let (dir_a, _) = Directory::new(
            store.clone(),
            "a".to_string(),
            timing(),
            Arc::new(Health::new()),
        );
        let (dir_b, _) = Directory::new(
            store.clone(),
            "b".to_string(),
            timing(),
            Arc::new(Health::new()),
        );

        dir_b.register(Role::Follower).await.unwrap();
        dir_b.refresh(Role::Follower).await.unwrap();
        assert!(!dir_a.observe().await.unwrap().is_empty());

        dir_b.mark_shutdown().await.unwrap();
        assert!(dir_a.observe().await.unwrap().is_empty());
    }

    #[test]
    fn test_health_machine() {
        let health = Health::new();
        assert_eq!(health.phase(), HealthPhase::Starting);
        assert!(!health.is_healthy());

        // One refresh alone is not enough
        health.record_refresh_ok();
        assert_eq!(health.phase(), HealthPhase::Starting);

        health.record_scan_ok();
        assert_eq!(health.phase(), HealthPhase::Active);
        assert!(health.is_healthy());

        for _ in 0..4 {
            health.record_refresh_failure(5);
        }
        assert_eq!(health.phase(), HealthPhase::Active);
        health.record_refresh_failure(5);
        assert_eq!(health.phase(), HealthPhase::Degraded);

        health.record_refresh_ok();
        assert_eq!(health.phase(), HealthPhase::Active);

        health.mark_shutdown();
        assert!(!health.is_healthy());
    }
}
