//! In-process shared store
//!
//! One `MemoryStore` shared across several in-process nodes gives them the
//! same key space and pub/sub fabric a real backend would, with lazy TTL
//! expiry. Used by integration tests and `--memory-store` standalone runs.

use super::{glob_match, SharedStore, StoreError, StoreInfo, StoreResult, Subscription};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const CHANNEL_DEPTH: usize = 256;

#[derive(Debug, Clone)]
enum Value {
    Plain(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn plain(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: Value::Plain(value.to_string()),
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Entry>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the key when its TTL has lapsed.
    fn purge(map: &mut HashMap<String, Entry>, key: &str) {
        if map.get(key).is_some_and(Entry::expired) {
            map.remove(key);
        }
    }

    fn sweep(map: &mut HashMap<String, Entry>) {
        map.retain(|_, entry| !entry.expired());
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn set_value(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut map = self.data.lock().unwrap();
        map.insert(key.to_string(), Entry::plain(value, None));
        Ok(())
    }

    async fn get_value(&self, key: &str) -> StoreResult<Option<String>> {
        let mut map = self.data.lock().unwrap();
        Self::purge(&mut map, key);
        match map.get(key) {
            Some(Entry { value: Value::Plain(v), .. }) => Ok(Some(v.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut map = self.data.lock().unwrap();
        Self::purge(&mut map, key);
        if map.contains_key(key) {
            return Ok(false);
        }
        map.insert(key.to_string(), Entry::plain(value, Some(ttl)));
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut map = self.data.lock().unwrap();
        Self::purge(&mut map, key);
        match map.get(key) {
            Some(Entry { value: Value::Plain(v), .. }) if v == expected => {
                map.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut map = self.data.lock().unwrap();
        Self::purge(&mut map, key);
        match map.get_mut(key) {
            Some(entry) => match &entry.value {
                Value::Plain(v) if v == expected => {
                    entry.expires_at = Some(Instant::now() + ttl);
                    Ok(true)
                }
                _ => Ok(false),
            },
            None => Ok(false),
        }
    }

    async fn increment_counter(&self, key: &str) -> StoreResult<i64> {
        let mut map = self.data.lock().unwrap();
        Self::purge(&mut map, key);
        let entry = map
            .entry(key.to_string())
            .or_insert_with(|| Entry::plain("0", None));
        match &mut entry.value {
            Value::Plain(v) => {
                let current: i64 = v
                    .parse()
                    .map_err(|_| StoreError::WrongType(key.to_string()))?;
                let next = current + 1;
                *v = next.to_string();
                Ok(next)
            }
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn add_to_set(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut map = self.data.lock().unwrap();
        Self::purge(&mut map, key);
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(HashSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Set(set) => Ok(set.insert(member.to_string())),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn is_member(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut map = self.data.lock().unwrap();
        Self::purge(&mut map, key);
        match map.get(key) {
            Some(Entry { value: Value::Set(set), .. }) => Ok(set.contains(member)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(false),
        }
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut map = self.data.lock().unwrap();
        Self::purge(&mut map, key);
        match map.get(key) {
            Some(Entry { value: Value::Set(set), .. }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        let mut map = self.data.lock().unwrap();
        Self::purge(&mut map, key);
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Hash(hash) => {
                for (field, value) in fields {
                    hash.insert(field.clone(), value.clone());
                }
                Ok(())
            }
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut map = self.data.lock().unwrap();
        Self::purge(&mut map, key);
        match map.get(key) {
            Some(Entry { value: Value::Hash(hash), .. }) => Ok(hash.clone()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(HashMap::new()),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut map = self.data.lock().unwrap();
        Self::purge(&mut map, key);
        match map.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut map = self.data.lock().unwrap();
        Self::purge(&mut map, key);
        Ok(map.remove(key).is_some())
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut map = self.data.lock().unwrap();
        Self::sweep(&mut map);
        Ok(map
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect())
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize> {
        let senders: Vec<mpsc::Sender<String>> = {
            let mut subs = self.subscribers.lock().unwrap();
            match subs.get_mut(channel) {
                Some(list) => {
                    list.retain(|tx| !tx.is_closed());
                    list.clone()
                }
                None => return Ok(0),
            }
        };

        let mut delivered = 0;
        for tx in senders {
            if tx.send(payload.to_string()).await.is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        self.subscribers
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn info(&self) -> StoreResult<StoreInfo> {
        Ok(StoreInfo {
            state: "ok".to_string(),
            members: 1,
        })
    }

    async fn size(&self) -> StoreResult<usize> {
        let mut map = self.data.lock().unwrap();
        Self::sweep(&mut map);
        Ok(map.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_if_absent_is_single_winner() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(10);

        assert!(store.set_if_absent("k", "a", ttl).await.unwrap());
        assert!(!store.set_if_absent("k", "b", ttl).await.unwrap());
        assert_eq!(store.get_value("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_ttl_expiry_frees_the_key() {
        let store = MemoryStore::new();
        store
            .set_if_absent("k", "a", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.get_value("k").await.unwrap(), None);
        assert!(store.set_if_absent("k", "b", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_delete_checks_value() {
        let store = MemoryStore::new();
        store.set_value("k", "mine").await.unwrap();

        assert!(!store.compare_and_delete("k", "theirs").await.unwrap());
        assert!(store.compare_and_delete("k", "mine").await.unwrap());
        assert!(!store.compare_and_delete("k", "mine").await.unwrap());
    }

    #[tokio::test]
    async fn test_counter_and_sets() {
        let store = MemoryStore::new();

        assert_eq!(store.increment_counter("c").await.unwrap(), 1);
        assert_eq!(store.increment_counter("c").await.unwrap(), 2);

        assert!(store.add_to_set("s", "v1").await.unwrap());
        assert!(!store.add_to_set("s", "v1").await.unwrap());
        assert!(store.is_member("s", "v1").await.unwrap());
        assert!(!store.is_member("s", "v2").await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_type_is_reported() {
        let store = MemoryStore::new();
        store.add_to_set("s", "v1").await.unwrap();

        assert!(matches!(
            store.increment_counter("s").await,
            Err(StoreError::WrongType(_))
        ));
    }

    #[tokio::test]
    async fn test_scan_matches_families() {
        let store = MemoryStore::new();
        store.set_value("{nodes}.a", "1").await.unwrap();
        store.set_value("{nodes}.b", "1").await.unwrap();
        store.set_value("{votes}.x", "1").await.unwrap();

        let mut keys = store.scan("{nodes}.*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["{nodes}.a", "{nodes}.b"]);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe("ch").await.unwrap();

        let delivered = store.publish("ch", "hello").await.unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(rx.recv().await.unwrap(), "hello");

        assert_eq!(store.publish("empty", "x").await.unwrap(), 0);
    }
}
