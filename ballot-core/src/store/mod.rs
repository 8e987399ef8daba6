//! Shared store abstraction
//!
//! The cluster coordinates through a small capability set (KV, hashes, sets,
//! counters, atomic set-if-absent and compare-and-delete, TTLs, scan and
//! pub/sub) rather than any vendor's API surface. `RedisStore` backs it with
//! a Redis deployment; `MemoryStore` provides the same semantics in-process
//! for tests and standalone runs.
//!
//! Keys that must co-reside on one shard carry an explicit hash tag; the
//! builders in [`keys`] are the only place key text is assembled.

pub mod keys;
pub mod memory;
pub mod redis;

pub use self::redis::RedisStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient failure (network, rebalance); callers may retry
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Non-transient backend failure
    #[error("store error: {0}")]
    Backend(String),

    /// An operation hit a key holding a different value type
    #[error("wrong value type for key {0}")]
    WrongType(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Inbound half of a channel subscription
pub type Subscription = mpsc::Receiver<String>;

/// Backend health summary for `/health`
#[derive(Debug, Clone, Serialize)]
pub struct StoreInfo {
    pub state: String,
    pub members: usize,
}

/// Capability set the coordination core depends on.
///
/// All operations carry the backend's atomicity guarantees:
/// `set_if_absent`, `compare_and_delete`, `compare_and_expire` and
/// `increment_counter` are single atomic steps.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Plain write.
    async fn set_value(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Plain read; `None` when missing or expired.
    async fn get_value(&self, key: &str) -> StoreResult<Option<String>>;

    /// Atomic "set if absent with TTL"; true only when the key did not exist.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Atomic delete-if-equal; true only when the current value matched.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Atomic re-expire-if-equal; true only when the current value matched.
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration)
        -> StoreResult<bool>;

    /// Atomic increment; returns the post-increment value.
    async fn increment_counter(&self, key: &str) -> StoreResult<i64>;

    /// Add to a set; true when the member was newly added.
    async fn add_to_set(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn is_member(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Write hash fields, creating the hash when missing.
    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()>;

    /// Read all hash fields; empty map when missing.
    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Set a TTL on an existing key; false when the key is missing.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Delete a key; true when something was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Keys matching a glob pattern.
    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Publish to a channel; returns the receiver count.
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize>;

    /// Subscribe to a channel; payloads arrive on the returned receiver.
    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;

    async fn ping(&self) -> StoreResult<()>;

    async fn info(&self) -> StoreResult<StoreInfo>;

    /// Number of live keys.
    async fn size(&self) -> StoreResult<usize>;
}

/// Retry schedule for transient store failures: 5 attempts, exponential
/// backoff from 200ms capped at 5s. Non-transient errors fail immediately.
pub async fn retrying<T, F, Fut>(label: &str, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = StoreResult<T>>,
{
    const MAX_ATTEMPTS: u32 = 5;
    let mut backoff = Duration::from_millis(200);

    for attempt in 1..=MAX_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                warn!(
                    "Store: {} failed (attempt {}/{}), retrying in {:?}: {}",
                    label, attempt, MAX_ATTEMPTS, backoff, err
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(5));
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("retry loop returns on the last attempt")
}

/// Glob match supporting `*` only, over ASCII key text.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let mut rest = key;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    // Pattern ended with '*'
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_glob_match() {
        assert!(glob_match("{nodes}.*", "{nodes}.node1"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("{election}.e1.candidate.*", "{election}.e1.candidate.c1"));
        assert!(!glob_match("{election}.e1.candidate.*", "{election}.e2.candidate.c1"));
        assert!(glob_match("{votes}.e1:*", "{votes}.e1:v1:abc"));
        assert!(!glob_match("{nodes}.node1", "{nodes}.node2"));
    }

    #[tokio::test]
    async fn test_retrying_gives_up_on_fatal() {
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = retrying("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Backend("boom".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retrying_retries_transient() {
        let calls = AtomicU32::new(0);
        let result = retrying("op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StoreError::Unavailable("flaky".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
