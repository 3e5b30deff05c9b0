//! `tiercache` server: clustered chain store with active/passive replication
//! and client invalidation.

pub mod clients;
pub mod config;
pub mod invalidation;
pub mod replication;
pub mod service;
pub mod storage;
pub mod telemetry;
pub mod tier;

pub use clients::{ClientId, ClientRegistry};
pub use config::{Consistency, ReplicationMode, TierConfig};
pub use replication::{ActiveReplicator, InProcessTransport, PassiveReplica};
pub use storage::ServerSideStore;
pub use tier::{ActiveTier, MutationAck, MutationRequest, TierError};
