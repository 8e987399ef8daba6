//! Node configuration
//!
//! Identity and store endpoints come from the environment (`NODE_ID`,
//! `NODE_ROLE`, `SHARED_STORE_NODES`, `LOG_DIR`); protocol timings carry
//! their defaults here so tests can shrink them.

use crate::types::{NodeId, Role};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Environment variable names recognized at startup
pub const ENV_NODE_ID: &str = "NODE_ID";
pub const ENV_NODE_ROLE: &str = "NODE_ROLE";
pub const ENV_STORE_NODES: &str = "SHARED_STORE_NODES";
pub const ENV_LOG_DIR: &str = "LOG_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid role '{0}' (expected 'leader' or 'follower')")]
    InvalidRole(String),

    #[error("invalid store endpoint '{0}' (expected host:port)")]
    InvalidEndpoint(String),
}

/// Complete node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique node identifier
    pub node_id: NodeId,

    /// Initial role hint, overridden once elections run
    pub initial_role: Role,

    /// Shared-store endpoints, `host:port`, tried in order
    pub store_nodes: Vec<String>,

    /// Directory for log output (stdout only when unset)
    pub log_dir: Option<PathBuf>,

    /// HTTP listen port
    pub http_port: u16,

    pub election: ElectionTiming,
    pub clock: ClockTiming,
    pub consensus: ConsensusTiming,
    pub directory: DirectoryTiming,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node1".to_string(),
            initial_role: Role::Follower,
            store_nodes: vec![
                "localhost:7000".to_string(),
                "localhost:7001".to_string(),
                "localhost:7002".to_string(),
            ],
            log_dir: None,
            http_port: 5000,
            election: ElectionTiming::default(),
            clock: ClockTiming::default(),
            consensus: ConsensusTiming::default(),
            directory: DirectoryTiming::default(),
        }
    }
}

impl NodeConfig {
    /// Build a config from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = NodeConfig::default();

        if let Ok(id) = std::env::var(ENV_NODE_ID) {
            if !id.trim().is_empty() {
                config.node_id = id;
            }
        }
        if let Ok(role) = std::env::var(ENV_NODE_ROLE) {
            config.initial_role = role
                .parse()
                .map_err(|_| ConfigError::InvalidRole(role.clone()))?;
        }
        if let Ok(nodes) = std::env::var(ENV_STORE_NODES) {
            config.store_nodes = parse_endpoints(&nodes)?;
        }
        if let Ok(dir) = std::env::var(ENV_LOG_DIR) {
            if !dir.trim().is_empty() {
                config.log_dir = Some(PathBuf::from(dir));
            }
        }

        Ok(config)
    }
}

/// Parse a comma-separated `host:port` list.
pub fn parse_endpoints(raw: &str) -> Result<Vec<String>, ConfigError> {
    let mut endpoints = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (host, port) = part
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidEndpoint(part.to_string()))?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(ConfigError::InvalidEndpoint(part.to_string()));
        }
        endpoints.push(part.to_string());
    }
    if endpoints.is_empty() {
        return Err(ConfigError::InvalidEndpoint(raw.to_string()));
    }
    Ok(endpoints)
}

/// Leader election timing
#[derive(Debug, Clone)]
pub struct ElectionTiming {
    /// Election timeout lower bound
    pub timeout_min: Duration,
    /// Election timeout upper bound
    pub timeout_max: Duration,
    /// Leader heartbeat cadence
    pub heartbeat_interval: Duration,
    /// Timeout check tick
    pub check_interval: Duration,
}

impl Default for ElectionTiming {
    fn default() -> Self {
        Self {
            timeout_min: Duration::from_secs(5),
            timeout_max: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(2),
            check_interval: Duration::from_millis(500),
        }
    }
}

/// Clock synchronization timing
#[derive(Debug, Clone)]
pub struct ClockTiming {
    /// Broadcast cadence during the startup phase
    pub startup_interval: Duration,
    /// Broadcast cadence after the startup phase
    pub steady_interval: Duration,
    /// Length of the startup phase
    pub startup_phase: Duration,
    /// Bounded drift-history length
    pub history_size: usize,
    /// A sync older than this is reported unsynced
    pub sync_max_age: Duration,
    /// Accepted future skew for submitted timestamps, seconds
    pub timestamp_tolerance: f64,
}

impl Default for ClockTiming {
    fn default() -> Self {
        Self {
            startup_interval: Duration::from_secs(5),
            steady_interval: Duration::from_secs(10),
            startup_phase: Duration::from_secs(60),
            history_size: 5,
            sync_max_age: Duration::from_secs(30),
            timestamp_tolerance: 5.0,
        }
    }
}

/// Consensus timing
#[derive(Debug, Clone)]
pub struct ConsensusTiming {
    /// Delay before the first quorum check
    pub initial_recheck: Duration,
    /// Delay between subsequent quorum checks
    pub recheck_interval: Duration,
    /// A proposal pending longer than this is abandoned
    pub pending_ttl: Duration,
}

impl Default for ConsensusTiming {
    fn default() -> Self {
        Self {
            initial_recheck: Duration::from_secs(2),
            recheck_interval: Duration::from_secs(3),
            pending_ttl: Duration::from_secs(60),
        }
    }
}

/// Node directory timing
#[derive(Debug, Clone)]
pub struct DirectoryTiming {
    /// Heartbeat refresh cadence
    pub heartbeat_interval: Duration,
    /// TTL set on the directory entry at each refresh
    pub heartbeat_ttl: Duration,
    /// Peer observer scan cadence
    pub observe_interval: Duration,
    /// A peer heartbeat older than this is inactive, seconds
    pub liveness_window: f64,
    /// Consecutive refresh failures before the node degrades
    pub failure_threshold: u32,
}

impl Default for DirectoryTiming {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            heartbeat_ttl: Duration::from_secs(10),
            observe_interval: Duration::from_secs(5),
            liveness_window: 10.0,
            failure_threshold: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoints() {
        let nodes = parse_endpoints("localhost:7000, localhost:7001").unwrap();
        assert_eq!(nodes, vec!["localhost:7000", "localhost:7001"]);
    }

    #[test]
    fn test_parse_endpoints_rejects_garbage() {
        assert!(parse_endpoints("localhost").is_err());
        assert!(parse_endpoints("host:notaport").is_err());
        assert!(parse_endpoints("").is_err());
    }

    #[test]
    fn test_default_timings_match_protocol() {
        let timing = ElectionTiming::default();
        assert_eq!(timing.timeout_min, Duration::from_secs(5));
        assert_eq!(timing.timeout_max, Duration::from_secs(10));
        assert_eq!(timing.heartbeat_interval, Duration::from_secs(2));

        let clock = ClockTiming::default();
        assert_eq!(clock.history_size, 5);
        assert_eq!(clock.steady_interval, Duration::from_secs(10));
    }
}
