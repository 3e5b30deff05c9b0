//! Active → passive replication messages.
//!
//! Messages are encoded as named `MsgPack` maps (`rmp_serde::to_vec_named()`)
//! with an internal `type` tag, the same shape the client protocol uses.

use serde::{Deserialize, Serialize};
use tiercache_core::Chain;

use super::error::{ProtocolMisuse, ReplicationError};
use crate::clients::ClientId;

/// Ordering domain of a replication message.
///
/// Bucket-keyed messages are ordered against other messages for the same
/// bucket; global messages are ordered against everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConcurrencyKey {
    Bucket(u64),
    Global,
}

/// A unit of replication traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ReplicationMessage {
    /// Registers a client identity. Must precede any chain message from it.
    ClientIdTrack { client_id: ClientId },
    /// Full chain of a bucket after a client mutation.
    ///
    /// `oldest_outstanding` is the client's lowest unacknowledged message id
    /// at the time; the passive forgets dedup state below it.
    ChainReplication {
        bucket: u64,
        chain: Chain,
        client_id: ClientId,
        message_id: u64,
        oldest_outstanding: u64,
    },
    /// A client cleared the whole store.
    ClearReplication {
        client_id: ClientId,
        message_id: u64,
        oldest_outstanding: u64,
    },
    /// The clear-all invalidation finished on the active.
    ClearInvalidationComplete,
    /// The invalidation for `bucket` finished on the active.
    InvalidationComplete { bucket: u64 },
}

impl ReplicationMessage {
    /// Stable name of the message kind, for logs and errors.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::ClientIdTrack { .. } => "CLIENT_ID_TRACK",
            Self::ChainReplication { .. } => "CHAIN_REPLICATION",
            Self::ClearReplication { .. } => "CLEAR_REPLICATION",
            Self::ClearInvalidationComplete => "CLEAR_INVALIDATION_COMPLETE",
            Self::InvalidationComplete { .. } => "INVALIDATION_COMPLETE",
        }
    }

    #[must_use]
    pub fn concurrency_key(&self) -> ConcurrencyKey {
        match self {
            Self::ChainReplication { bucket, .. } | Self::InvalidationComplete { bucket } => {
                ConcurrencyKey::Bucket(*bucket)
            }
            Self::ClientIdTrack { .. }
            | Self::ClearReplication { .. }
            | Self::ClearInvalidationComplete => ConcurrencyKey::Global,
        }
    }

    /// The originating client's message id, if this kind carries one.
    #[must_use]
    pub fn message_id(&self) -> Option<u64> {
        match self {
            Self::ChainReplication { message_id, .. } | Self::ClearReplication { message_id, .. } => {
                Some(*message_id)
            }
            _ => None,
        }
    }

    /// The originating client, if this kind carries one.
    #[must_use]
    pub fn client_id(&self) -> Option<ClientId> {
        match self {
            Self::ClientIdTrack { client_id }
            | Self::ChainReplication { client_id, .. }
            | Self::ClearReplication { client_id, .. } => Some(*client_id),
            _ => None,
        }
    }

    /// Like [`message_id`](Self::message_id) but treats absence as misuse.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolMisuse::IdNotSupported`] for id-less kinds.
    pub fn require_message_id(&self) -> Result<u64, ProtocolMisuse> {
        self.message_id()
            .ok_or(ProtocolMisuse::IdNotSupported {
                kind: self.kind_name(),
            })
    }

    /// Like [`client_id`](Self::client_id) but treats absence as misuse.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolMisuse::ClientIdNotSupported`] for kinds without a
    /// client.
    pub fn require_client_id(&self) -> Result<ClientId, ProtocolMisuse> {
        self.client_id()
            .ok_or(ProtocolMisuse::ClientIdNotSupported {
                kind: self.kind_name(),
            })
    }

    /// Message ids belong to the originating client and are never rewritten.
    ///
    /// # Errors
    ///
    /// Always returns [`ProtocolMisuse::RenumberingRejected`].
    pub fn set_message_id(&mut self, _message_id: u64) -> Result<(), ProtocolMisuse> {
        Err(ProtocolMisuse::RenumberingRejected {
            kind: self.kind_name(),
        })
    }

    /// Encodes the message as a named `MsgPack` map.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::Codec`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, ReplicationError> {
        rmp_serde::to_vec_named(self).map_err(|e| ReplicationError::Codec(e.to_string()))
    }

    /// Decodes a message produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::Codec`] if the bytes are not a valid message.
    pub fn decode(bytes: &[u8]) -> Result<Self, ReplicationError> {
        rmp_serde::from_slice(bytes).map_err(|e| ReplicationError::Codec(e.to_string()))
    }
}
