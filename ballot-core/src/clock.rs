//! Cluster clock synchronization
//!
//! The leader's wall clock is the reference: it broadcasts its time (fast
//! cadence for the first minute, then slower) and answers `sync_request`
//! with an immediate initial broadcast. Followers keep a bounded history of
//! measured drift, take the median to filter a single delayed broadcast,
//! and fold a fraction of it into their offset. Larger drift corrects more
//! aggressively; drift under 100ms is left alone.
//!
//! History samples measure drift against the *corrected* clock; applying a
//! correction rebases the stored samples by the applied amount so the
//! median stays comparable across corrections.

use crate::bus::{Channel, Communicator, Envelope};
use crate::config::ClockTiming;
use crate::store::{keys, SharedStore};
use crate::types::{wall_clock, NodeId, RoleView};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Drift above this corrects at 85% and prompts another sync request
const HIGH_DRIFT_SECS: f64 = 5.0;
/// Drift above this corrects at 65%
const MID_DRIFT_SECS: f64 = 1.0;
/// Drift above this corrects at 40%; below it, no correction
const LOW_DRIFT_SECS: f64 = 0.1;

/// Submitted timestamps older than this are rejected outright
const STALE_TIMESTAMP_SECS: f64 = 60.0;

/// Messages on the `time_sync` channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TimeSyncMessage {
    /// Leader's reference time
    #[serde(rename = "broadcast")]
    Broadcast {
        system_time: f64,
        broadcast_id: String,
        #[serde(default)]
        initial: bool,
    },

    /// Follower prompt for an immediate initial broadcast
    #[serde(rename = "sync_request")]
    SyncRequest { node_id: NodeId },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimestampError {
    #[error("timestamp is in the future beyond tolerance")]
    InFuture,

    #[error("timestamp is too far in the past")]
    TooOld,
}

/// Follower-visible sync status, reported under `/health`
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub synced: bool,
    pub offset: f64,
    pub last_sync: f64,
    pub sync_age: f64,
    pub is_leader: bool,
}

/// Outcome of processing one broadcast
#[derive(Debug, Clone, Copy)]
pub struct Correction {
    pub drift: f64,
    pub median: f64,
    pub factor: f64,
    pub applied: f64,
    pub request_resync: bool,
}

#[derive(Debug)]
struct ClockState {
    offset: f64,
    last_sync: f64,
    initial_sync_done: bool,
    history: VecDeque<f64>,
}

/// Per-node clock state; shared across tasks.
pub struct ClockSync {
    node_id: NodeId,
    timing: ClockTiming,
    state: Mutex<ClockState>,
}

impl ClockSync {
    pub fn new(node_id: NodeId, timing: ClockTiming, is_leader: bool) -> Self {
        Self {
            node_id,
            timing,
            state: Mutex::new(ClockState {
                offset: 0.0,
                last_sync: 0.0,
                initial_sync_done: is_leader,
                history: VecDeque::new(),
            }),
        }
    }

    /// Corrected wall-clock time. Until the first broadcast lands, this is
    /// plain local time.
    pub fn corrected_now(&self) -> f64 {
        wall_clock() + self.state.lock().unwrap().offset
    }

    pub fn offset(&self) -> f64 {
        self.state.lock().unwrap().offset
    }

    pub fn initial_sync_done(&self) -> bool {
        self.state.lock().unwrap().initial_sync_done
    }

    /// The leader is the reference: zero offset, nothing to wait for.
    pub fn become_reference(&self) {
        let mut state = self.state.lock().unwrap();
        state.offset = 0.0;
        state.initial_sync_done = true;
        state.history.clear();
    }

    /// Fold one leader broadcast into the offset.
    pub fn record_broadcast(&self, leader_time: f64) -> Correction {
        let mut state = self.state.lock().unwrap();
        let drift = leader_time - (wall_clock() + state.offset);

        state.history.push_back(drift);
        while state.history.len() > self.timing.history_size {
            state.history.pop_front();
        }

        let median = median_of(&state.history);
        let factor = correction_factor(median.abs());
        let applied = median * factor;

        if applied != 0.0 {
            state.offset += applied;
            // Keep stored samples comparable with the corrected clock
            for sample in state.history.iter_mut() {
                *sample -= applied;
            }
        }

        state.last_sync = wall_clock();
        state.initial_sync_done = true;

        Correction {
            drift,
            median,
            factor,
            applied,
            request_resync: median.abs() > HIGH_DRIFT_SECS,
        }
    }

    pub fn status(&self, is_leader: bool) -> SyncStatus {
        let state = self.state.lock().unwrap();
        let sync_age = if state.last_sync > 0.0 {
            (wall_clock() - state.last_sync).max(0.0)
        } else {
            f64::INFINITY
        };
        let synced = if is_leader {
            true
        } else {
            state.initial_sync_done && sync_age < self.timing.sync_max_age.as_secs_f64()
        };
        SyncStatus {
            synced,
            offset: state.offset,
            last_sync: state.last_sync,
            sync_age,
            is_leader,
        }
    }

    /// Accept timestamps up to the tolerance in the future (inclusive) and
    /// no more than a minute in the past.
    pub fn validate_timestamp(&self, timestamp: f64) -> Result<(), TimestampError> {
        let now = self.corrected_now();
        if timestamp > now + self.timing.timestamp_tolerance {
            return Err(TimestampError::InFuture);
        }
        if timestamp < now - STALE_TIMESTAMP_SECS {
            return Err(TimestampError::TooOld);
        }
        Ok(())
    }
}

fn correction_factor(drift_abs: f64) -> f64 {
    if drift_abs > HIGH_DRIFT_SECS {
        0.85
    } else if drift_abs > MID_DRIFT_SECS {
        0.65
    } else if drift_abs > LOW_DRIFT_SECS {
        0.40
    } else {
        0.0
    }
}

fn median_of(history: &VecDeque<f64>) -> f64 {
    if history.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = history.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

/// Publish one reference broadcast and mirror it under `{system}.time`.
async fn emit_broadcast(
    clock: &ClockSync,
    com: &Communicator,
    store: &Arc<dyn SharedStore>,
    initial: bool,
) {
    let system_time = clock.corrected_now();
    if let Err(err) = store
        .set_value(&keys::system_time(), &system_time.to_string())
        .await
    {
        warn!("ClockSync: failed to record reference time: {}", err);
    }

    let message = TimeSyncMessage::Broadcast {
        system_time,
        broadcast_id: Uuid::new_v4().to_string(),
        initial,
    };
    if let Err(err) = com.broadcast(Channel::TimeSync, &message).await {
        warn!("ClockSync: broadcast failed: {}", err);
    } else {
        debug!("ClockSync: broadcast reference time {:.3}", system_time);
    }
}

/// Leader cadence loop: emit immediately, then every `startup_interval` for
/// the first minute, then every `steady_interval`. Followers idle here until
/// they win an election.
pub async fn run_broadcast_loop(
    clock: Arc<ClockSync>,
    com: Communicator,
    store: Arc<dyn SharedStore>,
    role_rx: watch::Receiver<RoleView>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("ClockSync: broadcast loop started");
    let started = Instant::now();
    let mut was_leader = false;

    loop {
        let is_leader = role_rx.borrow().is_leader();
        if is_leader && !was_leader {
            clock.become_reference();
            info!("ClockSync: now the cluster time reference");
            emit_broadcast(&clock, &com, &store, true).await;
        } else if is_leader {
            emit_broadcast(&clock, &com, &store, false).await;
        }
        was_leader = is_leader;

        let interval = if started.elapsed() < clock.timing.startup_phase {
            clock.timing.startup_interval
        } else {
            clock.timing.steady_interval
        };

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("ClockSync: broadcast loop stopped");
}

/// Inbound `time_sync` handler: followers fold broadcasts into their offset
/// and may prompt a resync; the leader answers sync requests immediately.
pub async fn run_sync_loop(
    clock: Arc<ClockSync>,
    com: Communicator,
    store: Arc<dyn SharedStore>,
    role_rx: watch::Receiver<RoleView>,
    mut rx: mpsc::Receiver<Envelope<TimeSyncMessage>>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("ClockSync: sync loop started");

    // Prompt the leader for an immediate initial broadcast
    if !role_rx.borrow().is_leader() {
        let request = TimeSyncMessage::SyncRequest {
            node_id: clock.node_id.clone(),
        };
        if let Err(err) = com.broadcast(Channel::TimeSync, &request).await {
            warn!("ClockSync: initial sync request failed: {}", err);
        }
    }

    loop {
        tokio::select! {
            envelope = rx.recv() => {
                let Some(envelope) = envelope else { break };
                match envelope.payload {
                    TimeSyncMessage::Broadcast { system_time, initial, .. } => {
                        if role_rx.borrow().is_leader() {
                            continue;
                        }
                        let correction = clock.record_broadcast(system_time);
                        info!(
                            "ClockSync: broadcast from {} (initial={}): drift={:+.3}s median={:+.3}s applied={:+.3}s",
                            envelope.sender, initial, correction.drift,
                            correction.median, correction.applied
                        );
                        if correction.request_resync {
                            let request = TimeSyncMessage::SyncRequest {
                                node_id: clock.node_id.clone(),
                            };
                            if let Err(err) = com.broadcast(Channel::TimeSync, &request).await {
                                warn!("ClockSync: resync request failed: {}", err);
                            }
                        }
                    }
                    TimeSyncMessage::SyncRequest { node_id } => {
                        if role_rx.borrow().is_leader() {
                            debug!("ClockSync: sync request from {}", node_id);
                            emit_broadcast(&clock, &com, &store, true).await;
                        }
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
    info!("ClockSync: sync loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn follower_clock() -> ClockSync {
        ClockSync::new("f1".to_string(), ClockTiming::default(), false)
    }

    #[test]
    fn test_correction_tiers() {
        assert_eq!(correction_factor(8.0), 0.85);
        assert_eq!(correction_factor(3.0), 0.65);
        assert_eq!(correction_factor(0.5), 0.40);
        assert_eq!(correction_factor(0.05), 0.0);
    }

    #[test]
    fn test_median_of_bounded_history() {
        let history: VecDeque<f64> = vec![1.0, 9.0, 2.0].into();
        assert_eq!(median_of(&history), 2.0);

        let history: VecDeque<f64> = vec![1.0, 3.0].into();
        assert_eq!(median_of(&history), 2.0);

        assert_eq!(median_of(&VecDeque::new()), 0.0);
    }

    #[test]
    fn test_large_skew_converges_within_three_broadcasts() {
        let clock = follower_clock();
        // Leader runs 8 seconds ahead of this node
        let skew = 8.0;

        let first = clock.record_broadcast(wall_clock() + skew);
        assert_eq!(first.factor, 0.85);
        assert!(first.request_resync);
        assert!(clock.offset() > 6.0);

        clock.record_broadcast(wall_clock() + skew);
        assert!(clock.offset() > 7.0);

        clock.record_broadcast(wall_clock() + skew);
        // Residual error against the reference is under a second
        let residual = (wall_clock() + skew) - clock.corrected_now();
        assert!(residual.abs() < 1.0, "residual {}", residual);
    }

    #[test]
    fn test_sub_threshold_drift_is_ignored() {
        let clock = follower_clock();
        let correction = clock.record_broadcast(wall_clock() + 0.05);
        assert_eq!(correction.applied, 0.0);
        assert_eq!(clock.offset(), 0.0);
        assert!(clock.initial_sync_done());
    }

    #[test]
    fn test_median_filters_one_delayed_broadcast() {
        let clock = follower_clock();
        for _ in 0..3 {
            clock.record_broadcast(wall_clock());
        }
        // One pathological sample among steady ones must not move the clock
        let correction = clock.record_broadcast(wall_clock() + 4.0);
        assert!(correction.applied.abs() < 0.1);
        assert!(clock.offset().abs() < 0.1);
    }

    #[test]
    fn test_leader_is_reference() {
        let clock = ClockSync::new("l1".to_string(), ClockTiming::default(), true);
        assert!(clock.initial_sync_done());
        assert_eq!(clock.offset(), 0.0);

        let status = clock.status(true);
        assert!(status.synced);
        assert!(status.is_leader);
    }

    #[test]
    fn test_status_before_first_sync() {
        let clock = follower_clock();
        let status = clock.status(false);
        assert!(!status.synced);

        clock.record_broadcast(wall_clock());
        assert!(clock.status(false).synced);
    }

    #[test]
    fn test_timestamp_validation_boundaries() {
        let clock = follower_clock();
        let now = clock.corrected_now();

        assert!(clock.validate_timestamp(now).is_ok());
        // Exactly at the tolerance edge is accepted; just past it is not
        assert!(clock.validate_timestamp(now + 5.0).is_ok());
        assert_eq!(
            clock.validate_timestamp(now + 5.001),
            Err(TimestampError::InFuture)
        );
        assert_eq!(
            clock.validate_timestamp(now + 5.5),
            Err(TimestampError::InFuture)
        );
        assert_eq!(
            clock.validate_timestamp(now - 61.0),
            Err(TimestampError::TooOld)
        );
    }
}
