//! Distributed mutex
//!
//! A named lock over the store's atomic primitives: acquisition is a
//! `set_if_absent` with TTL, release is a compare-and-delete that can never
//! remove another holder's lock, extension is a compare-and-expire. An
//! expired lock is reclaimable by any node.

use crate::store::{keys, SharedStore, StoreError};
use crate::types::NodeId;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MutexError {
    #[error("could not acquire lock on {0} before the wait elapsed")]
    Timeout(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A handle on one named lock. The `owner` flag is set only by a successful
/// acquire and cleared only by a successful release (or a detected loss).
pub struct DistributedMutex {
    store: Arc<dyn SharedStore>,
    lock_key: String,
    lock_value: String,
    ttl: Duration,
    owner: bool,
}

impl DistributedMutex {
    pub fn new(
        store: Arc<dyn SharedStore>,
        resource: &str,
        node_id: &NodeId,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            lock_key: keys::mutex(resource),
            lock_value: format!("{}:{}", node_id, Uuid::new_v4()),
            ttl,
            owner: false,
        }
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Try to take the lock until `wait` elapses, pausing `retry` between
    /// attempts. Store errors count as failed attempts.
    pub async fn acquire(&mut self, wait: Duration, retry: Duration) -> bool {
        let deadline = Instant::now() + wait;

        loop {
            match self
                .store
                .set_if_absent(&self.lock_key, &self.lock_value, self.ttl)
                .await
            {
                Ok(true) => {
                    debug!("Mutex: acquired {}", self.lock_key);
                    self.owner = true;
                    return true;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!("Mutex: error acquiring {}: {}", self.lock_key, err);
                }
            }

            if Instant::now() + retry > deadline {
                warn!(
                    "Mutex: failed to acquire {} within {:?}",
                    self.lock_key, wait
                );
                return false;
            }
            tokio::time::sleep(retry).await;
        }
    }

    /// Release the lock if we hold it. Returns false when the lock already
    /// expired or belongs to another node.
    pub async fn release(&mut self) -> Result<bool, MutexError> {
        if !self.owner {
            return Ok(false);
        }

        let released = self
            .store
            .compare_and_delete(&self.lock_key, &self.lock_value)
            .await?;
        if released {
            debug!("Mutex: released {}", self.lock_key);
            self.owner = false;
        } else {
            warn!(
                "Mutex: {} already expired or held by another node",
                self.lock_key
            );
        }
        Ok(released)
    }

    /// Push the TTL out while still holding the lock. A mismatch means the
    /// lock was lost; the owner flag drops.
    pub async fn extend(&mut self, additional: Option<Duration>) -> Result<bool, MutexError> {
        if !self.owner {
            return Ok(false);
        }

        let ttl = additional.unwrap_or(self.ttl);
        let extended = self
            .store
            .compare_and_expire(&self.lock_key, &self.lock_value, ttl)
            .await?;
        if extended {
            debug!("Mutex: extended {} by {:?}", self.lock_key, ttl);
        } else {
            warn!("Mutex: lost {} before extension", self.lock_key);
            self.owner = false;
        }
        Ok(extended)
    }

    /// Scoped acquisition: run `work` under the lock and release on every
    /// exit path, including when `work`'s result is an error.
    pub async fn locked<T, F>(&mut self, wait: Duration, retry: Duration, work: F) -> Result<T, MutexError>
    where
        F: std::future::Future<Output = T>,
    {
        if !self.acquire(wait, retry).await {
            return Err(MutexError::Timeout(self.lock_key.clone()));
        }
        let out = work.await;
        if let Err(err) = self.release().await {
            warn!("Mutex: release after scoped work failed: {}", err);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const WAIT: Duration = Duration::from_millis(50);
    const RETRY: Duration = Duration::from_millis(5);

    fn mutex(store: &Arc<MemoryStore>, node: &str) -> DistributedMutex {
        let store: Arc<dyn SharedStore> = store.clone();
        DistributedMutex::new(store, "tally", &node.to_string(), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_single_holder() {
        let store = Arc::new(MemoryStore::new());
        let mut a = mutex(&store, "a");
        let mut b = mutex(&store, "b");

        assert!(a.acquire(WAIT, RETRY).await);
        assert!(a.is_owner());
        assert!(!b.acquire(WAIT, RETRY).await);
        assert!(!b.is_owner());

        assert!(a.release().await.unwrap());
        assert!(b.acquire(WAIT, RETRY).await);
    }

    #[tokio::test]
    async fn test_release_never_touches_foreign_lock() {
        let store = Arc::new(MemoryStore::new());
        let mut a = mutex(&store, "a");
        let mut b = mutex(&store, "b");

        assert!(a.acquire(WAIT, RETRY).await);
        // b never acquired; releasing must not remove a's lock
        assert!(!b.release().await.unwrap());
        assert!(!b.acquire(WAIT, RETRY).await);
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimable() {
        let store = Arc::new(MemoryStore::new());
        let shared: Arc<dyn SharedStore> = store.clone();
        let mut a = DistributedMutex::new(
            shared,
            "tally",
            &"a".to_string(),
            Duration::from_millis(10),
        );
        let mut b = mutex(&store, "b");

        assert!(a.acquire(WAIT, RETRY).await);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(b.acquire(WAIT, RETRY).await);
        // a's late release must not disturb b's lock
        assert!(!a.release().await.unwrap());
        assert!(b.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_reports_loss() {
        let store = Arc::new(MemoryStore::new());
        let shared: Arc<dyn SharedStore> = store.clone();
        let mut a = DistributedMutex::new(
            shared,
            "tally",
            &"a".to_string(),
            Duration::from_millis(10),
        );

        assert!(a.acquire(WAIT, RETRY).await);
        assert!(a.extend(Some(Duration::from_secs(30))).await.unwrap());

        let mut b = mutex(&store, "b");
        assert!(!b.acquire(WAIT, RETRY).await);
    }

    #[tokio::test]
    async fn test_scoped_releases_on_exit() {
        let store = Arc::new(MemoryStore::new());
        let mut a = mutex(&store, "a");
        let mut b = mutex(&store, "b");

        let out = a.locked(WAIT, RETRY, async { 7 }).await.unwrap();
        assert_eq!(out, 7);
        assert!(!a.is_owner());
        assert!(b.acquire(WAIT, RETRY).await);
    }
}
