//! Errors surfaced to callers of the active tier.

use crate::clients::ClientId;
use crate::replication::ReplicationError;
use crate::storage::StoreError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TierError {
    #[error("client {client} is not attached")]
    UnknownClient { client: ClientId },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Replication(#[from] ReplicationError),
}
