//! Inter-node message bus
//!
//! A thin typed layer over the store's pub/sub: a closed set of named
//! channels, a self-describing `{sender, type, timestamp, data}` envelope,
//! and per-channel listener tasks that decode into each channel's tagged
//! payload enum and drop self-originated traffic. Delivery is at-most-once
//! and unordered; every protocol above tolerates loss.

use crate::store::{retrying, SharedStore, StoreResult};
use crate::types::{wall_clock, NodeId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// The closed channel set of the cluster bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    VoteProposal,
    VoteResponse,
    VoteFinalization,
    TimeSync,
    LeaderElection,
    ElectionAdmin,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::VoteProposal,
        Channel::VoteResponse,
        Channel::VoteFinalization,
        Channel::TimeSync,
        Channel::LeaderElection,
        Channel::ElectionAdmin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::VoteProposal => "vote_proposal",
            Channel::VoteResponse => "vote_response",
            Channel::VoteFinalization => "vote_finalization",
            Channel::TimeSync => "time_sync",
            Channel::LeaderElection => "leader_election",
            Channel::ElectionAdmin => "election_admin",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire envelope. The payload enum flattens into `type` + `data`, producing
/// `{sender, type, timestamp, data}` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<P> {
    pub sender: NodeId,
    pub timestamp: f64,
    #[serde(flatten)]
    pub payload: P,
}

#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
}

struct Inner {
    node_id: NodeId,
    store: Arc<dyn SharedStore>,
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
}

/// Handle for publishing and subscribing on the cluster bus. Cheap to clone.
#[derive(Clone)]
pub struct Communicator {
    inner: Arc<Inner>,
}

impl Communicator {
    pub fn new(store: Arc<dyn SharedStore>, node_id: NodeId) -> Self {
        Self {
            inner: Arc::new(Inner {
                node_id,
                store,
                sent: AtomicU64::new(0),
                received: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    /// Publish a typed payload to a channel, enveloped and stamped.
    pub async fn broadcast<P: Serialize>(&self, channel: Channel, payload: &P) -> StoreResult<()> {
        let envelope = Envelope {
            sender: self.inner.node_id.clone(),
            timestamp: wall_clock(),
            payload,
        };
        let wire = serde_json::to_string(&envelope)?;

        let receivers = retrying(channel.as_str(), || {
            let wire = wire.clone();
            let store = self.inner.store.clone();
            async move { store.publish(channel.as_str(), &wire).await }
        })
        .await?;

        self.inner.sent.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Bus: sent on {} to {} receivers",
            channel.as_str(),
            receivers
        );
        Ok(())
    }

    /// Subscribe to a channel and forward decoded envelopes into `tx`.
    ///
    /// Self-originated envelopes are dropped here, so every subsystem sees
    /// only peer traffic. Undecodable payloads (unknown `type`, bad JSON)
    /// are logged and dropped, never dispatched.
    pub async fn listen<P>(
        &self,
        channel: Channel,
        tx: mpsc::Sender<Envelope<P>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> StoreResult<JoinHandle<()>>
    where
        P: DeserializeOwned + Send + 'static,
    {
        let mut subscription = self.inner.store.subscribe(channel.as_str()).await?;
        let inner = self.inner.clone();

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    raw = subscription.recv() => {
                        let Some(raw) = raw else { break };
                        match serde_json::from_str::<Envelope<P>>(&raw) {
                            Ok(envelope) => {
                                if envelope.sender == inner.node_id {
                                    continue;
                                }
                                inner.received.fetch_add(1, Ordering::Relaxed);
                                if tx.send(envelope).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                inner.dropped.fetch_add(1, Ordering::Relaxed);
                                warn!(
                                    "Bus: dropping undecodable message on {}: {}",
                                    channel.as_str(),
                                    err
                                );
                            }
                        }
                    }
                }
            }
            debug!("Bus: listener on {} stopped", channel.as_str());
        }))
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            sent: self.inner.sent.load(Ordering::Relaxed),
            received: self.inner.received.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    #[serde(tag = "type", content = "data")]
    enum TestMessage {
        #[serde(rename = "ping")]
        Ping { n: u32 },
    }

    fn harness() -> (Arc<MemoryStore>, watch::Sender<bool>, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Arc::new(MemoryStore::new()), tx, rx)
    }

    #[test]
    fn test_envelope_wire_format() {
        let envelope = Envelope {
            sender: "node1".to_string(),
            timestamp: 12.5,
            payload: TestMessage::Ping { n: 7 },
        };
        let wire: serde_json::Value =
            serde_json::to_value(&envelope).unwrap();

        assert_eq!(wire["sender"], "node1");
        assert_eq!(wire["type"], "ping");
        assert_eq!(wire["data"]["n"], 7);
        assert_eq!(wire["timestamp"], 12.5);
    }

    #[tokio::test]
    async fn test_listener_filters_self() {
        let (store, _shutdown_tx, shutdown) = harness();
        let alice = Communicator::new(store.clone(), "alice".to_string());
        let bob = Communicator::new(store.clone(), "bob".to_string());

        let (tx, mut rx) = mpsc::channel(8);
        alice
            .listen::<TestMessage>(Channel::TimeSync, tx, shutdown)
            .await
            .unwrap();

        alice
            .broadcast(Channel::TimeSync, &TestMessage::Ping { n: 1 })
            .await
            .unwrap();
        bob.broadcast(Channel::TimeSync, &TestMessage::Ping { n: 2 })
            .await
            .unwrap();

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.sender, "bob");
        assert_eq!(envelope.payload, TestMessage::Ping { n: 2 });
    }

    #[tokio::test]
    async fn test_unknown_type_is_dropped() {
        let (store, _shutdown_tx, shutdown) = harness();
        let alice = Communicator::new(store.clone(), "alice".to_string());

        let (tx, mut rx) = mpsc::channel(8);
        alice
            .listen::<TestMessage>(Channel::TimeSync, tx, shutdown)
            .await
            .unwrap();

        store
            .publish(
                "time_sync",
                r#"{"sender":"bob","timestamp":1.0,"type":"mystery","data":{}}"#,
            )
            .await
            .unwrap();
        store
            .publish(
                "time_sync",
                r#"{"sender":"bob","timestamp":1.0,"type":"ping","data":{"n":3}}"#,
            )
            .await
            .unwrap();

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.payload, TestMessage::Ping { n: 3 });
        assert_eq!(alice.stats().dropped, 1);
    }
}
