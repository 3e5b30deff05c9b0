//! Replication error types.

use crate::clients::ClientId;
use crate::storage::StoreError;

/// Protocol contract violations. These indicate a bug on the sending side,
/// never a transient condition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolMisuse {
    #[error("{kind} carries no message id")]
    IdNotSupported { kind: &'static str },
    #[error("{kind} carries no client id")]
    ClientIdNotSupported { kind: &'static str },
    #[error("{kind}: message ids cannot be renumbered")]
    RenumberingRejected { kind: &'static str },
    #[error("chain message from client {client} arrived before its CLIENT_ID_TRACK")]
    UntrackedClient { client: ClientId },
}

/// Errors surfaced by the replication channel.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplicationError {
    #[error("protocol misuse: {0}")]
    ProtocolMisuse(#[from] ProtocolMisuse),
    #[error("passive store: {0}")]
    Store(#[from] StoreError),
    #[error("replication transport closed")]
    TransportClosed,
    #[error("replication message codec: {0}")]
    Codec(String),
}
