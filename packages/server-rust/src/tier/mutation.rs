//! Inbound client mutations and their acknowledgements.

use tiercache_core::{Key, Operation, Timestamp};

use crate::clients::ClientId;
use crate::invalidation::InvalidationId;

/// The write a client asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationKind {
    Put { value: Vec<u8> },
    Remove,
    Replace { value: Vec<u8> },
    ConditionalReplace { expected: Vec<u8>, value: Vec<u8> },
    ConditionalRemove { expected: Vec<u8> },
}

/// A client mutation addressed to the active tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRequest {
    pub client_id: ClientId,
    /// Client-assigned id, unique per client, starting at 1.
    pub message_id: u64,
    /// Lowest message id this client has not yet seen acknowledged. Dedup
    /// state below it is dropped; ids below it count as duplicates.
    pub oldest_outstanding: u64,
    pub key: Key,
    pub kind: MutationKind,
}

impl MutationRequest {
    /// A request whose only outstanding message is itself.
    #[must_use]
    pub fn new(client_id: ClientId, message_id: u64, key: Key, kind: MutationKind) -> Self {
        Self {
            client_id,
            message_id,
            oldest_outstanding: message_id,
            key,
            kind,
        }
    }

    /// Sets the client's lowest unacknowledged id. Clamped to `message_id`.
    #[must_use]
    pub fn with_oldest_outstanding(mut self, oldest: u64) -> Self {
        self.oldest_outstanding = oldest.min(self.message_id);
        self
    }

    #[must_use]
    pub fn put(client_id: ClientId, message_id: u64, key: Key, value: Vec<u8>) -> Self {
        Self::new(client_id, message_id, key, MutationKind::Put { value })
    }

    #[must_use]
    pub fn remove(client_id: ClientId, message_id: u64, key: Key) -> Self {
        Self::new(client_id, message_id, key, MutationKind::Remove)
    }

    #[must_use]
    pub fn bucket(&self) -> u64 {
        self.key.bucket_hash()
    }

    /// Stamps the request into a chain operation.
    #[must_use]
    pub fn into_operation(self, timestamp: Timestamp) -> Operation {
        let key = self.key;
        match self.kind {
            MutationKind::Put { value } => Operation::put(key, value, timestamp),
            MutationKind::Remove => Operation::remove(key, timestamp),
            MutationKind::Replace { value } => Operation::replace(key, value, timestamp),
            MutationKind::ConditionalReplace { expected, value } => {
                Operation::conditional_replace(key, expected, value, timestamp)
            }
            MutationKind::ConditionalRemove { expected } => {
                Operation::conditional_remove(key, expected, timestamp)
            }
        }
    }
}

/// How the tier answered a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationAck {
    /// Applied, replicated per the replication mode, and invalidated per
    /// the consistency mode.
    Applied { invalidation: InvalidationId },
    /// The message id was already processed; nothing was appended.
    Duplicate,
}
