//! Redis-backed shared store
//!
//! Speaks to the first reachable endpoint of the configured list through a
//! `ConnectionManager` (auto-reconnect); each subscription runs on its own
//! pub/sub connection. Compare-and-delete and compare-and-expire execute as
//! Lua scripts so the check and the write are one atomic step on the server.

use super::{SharedStore, StoreError, StoreInfo, StoreResult, Subscription};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

const CHANNEL_DEPTH: usize = 256;

const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

const COMPARE_AND_EXPIRE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('expire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_timeout()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_cluster_error()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

pub struct RedisStore {
    client: redis::Client,
    manager: ConnectionManager,
    endpoint: String,
    compare_and_delete: Script,
    compare_and_expire: Script,
}

impl RedisStore {
    /// Connect to the first reachable endpoint of the list.
    pub async fn connect(endpoints: &[String]) -> StoreResult<Self> {
        let mut last_error: Option<StoreError> = None;

        for endpoint in endpoints {
            let url = format!("redis://{}/", endpoint);
            let client = match redis::Client::open(url.as_str()) {
                Ok(client) => client,
                Err(err) => {
                    last_error = Some(err.into());
                    continue;
                }
            };
            match ConnectionManager::new(client.clone()).await {
                Ok(manager) => {
                    info!("Store: connected to {}", endpoint);
                    return Ok(Self {
                        client,
                        manager,
                        endpoint: endpoint.clone(),
                        compare_and_delete: Script::new(COMPARE_AND_DELETE_SCRIPT),
                        compare_and_expire: Script::new(COMPARE_AND_EXPIRE_SCRIPT),
                    });
                }
                Err(err) => {
                    warn!("Store: endpoint {} unreachable: {}", endpoint, err);
                    last_error = Some(err.into());
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| StoreError::Unavailable("no store endpoints configured".to_string())))
    }

    /// Startup connection schedule: bounded attempts with exponential backoff
    /// from 1s capped at 30s. Exhausting it is a fatal startup error.
    pub async fn connect_with_retry(endpoints: &[String], max_attempts: u32) -> StoreResult<Self> {
        let mut backoff = Duration::from_secs(1);
        let mut last_error = StoreError::Unavailable("no connection attempts made".to_string());

        for attempt in 1..=max_attempts {
            info!(
                "Store: connecting to {:?} (attempt {}/{})",
                endpoints, attempt, max_attempts
            );
            match Self::connect(endpoints).await {
                Ok(store) => match store.ping().await {
                    Ok(()) => return Ok(store),
                    Err(err) => last_error = err,
                },
                Err(err) => last_error = err,
            }
            if attempt < max_attempts {
                warn!(
                    "Store: connection attempt {} failed: {}; retrying in {:?}",
                    attempt, last_error, backoff
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
        }

        Err(last_error)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn parse_cluster_state(raw: &str) -> Option<String> {
    raw.lines()
        .find_map(|line| line.strip_prefix("cluster_state:"))
        .map(|state| state.trim().to_string())
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn set_value(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn get_value(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.conn();
        let extended: i64 = self
            .compare_and_expire
            .key(key)
            .arg(expected)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn increment_counter(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.conn();
        let value: i64 = conn.incr(key, 1i64).await?;
        Ok(value)
    }

    async fn add_to_set(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let added: i64 = conn.sadd(key, member).await?;
        Ok(added == 1)
    }

    async fn is_member(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let found: bool = conn.sismember(key, member).await?;
        Ok(found)
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn();
        let applied: bool = conn.expire(key, ttl_secs(ttl) as i64).await?;
        Ok(applied)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<String> = conn.scan_match(pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize> {
        let mut conn = self.conn();
        let receivers: i64 = conn.publish(channel, payload).await?;
        Ok(receivers.max(0) as usize)
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let channel_name = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!("Store: undecodable message on {}: {}", channel_name, err);
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            info!("Store: subscription to {} closed", channel_name);
        });

        Ok(rx)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn info(&self) -> StoreResult<StoreInfo> {
        let mut conn = self.conn();
        let cluster_info: Result<String, redis::RedisError> = redis::cmd("CLUSTER")
            .arg("INFO")
            .query_async(&mut conn)
            .await;

        match cluster_info {
            Ok(raw) => {
                let state =
                    parse_cluster_state(&raw).unwrap_or_else(|| "unknown".to_string());
                let members = match redis::cmd("CLUSTER")
                    .arg("NODES")
                    .query_async::<_, String>(&mut conn)
                    .await
                {
                    Ok(nodes) => nodes.lines().filter(|l| !l.trim().is_empty()).count().max(1),
                    Err(_) => 1,
                };
                Ok(StoreInfo { state, members })
            }
            // Standalone backend without cluster support
            Err(_) => {
                self.ping().await?;
                Ok(StoreInfo {
                    state: "ok".to_string(),
                    members: 1,
                })
            }
        }
    }

    async fn size(&self) -> StoreResult<usize> {
        let mut conn = self.conn();
        let keys: i64 = redis::cmd("DBSIZE").query_async(&mut conn).await?;
        Ok(keys.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_floor_is_one_second() {
        assert_eq!(ttl_secs(Duration::from_millis(100)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(30)), 30);
    }

    #[test]
    fn test_parse_cluster_state() {
        let raw = "cluster_enabled:1\r\ncluster_state:ok\r\ncluster_size:3\r\n";
        assert_eq!(parse_cluster_state(raw).as_deref(), Some("ok"));
        assert_eq!(parse_cluster_state("no such field"), None);
    }
}
