//! Ballot Core Library
//!
//! Coordination core for a replicated voting cluster: shared-store layer,
//! node directory, message bus, clock synchronization, leader election,
//! distributed mutex, per-vote consensus and the vote effect layer.

pub mod bus;
pub mod clock;
pub mod config;
pub mod consensus;
pub mod directory;
pub mod election;
pub mod mutex;
pub mod node;
pub mod store;
pub mod types;
pub mod votes;

pub use bus::{Channel, Communicator, Envelope};
pub use clock::ClockSync;
pub use config::NodeConfig;
pub use consensus::{Consensus, SubmitError, VoteStatus};
pub use directory::{Directory, Health, HealthPhase, PeerSet};
pub use election::Election;
pub use mutex::DistributedMutex;
pub use node::Node;
pub use store::{MemoryStore, RedisStore, SharedStore, StoreError};
pub use types::*;
pub use votes::VoteStore;
