//! Outbound invalidation requests to attached clients.
//!
//! The tier never writes to a socket itself. It hands invalidation requests
//! to a [`ClientNotifier`]; the network layer (outside this crate) drains
//! them and later reports acknowledgements back through
//! `ActiveTier::acknowledge_invalidation`.

use tokio::sync::mpsc;
use tracing::debug;

use super::ClientId;
use crate::invalidation::InvalidationId;

/// Request sent to one client asking it to drop locally cached state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientInvalidation {
    /// Drop every cached entry whose key hashes to `bucket`.
    Hash {
        client: ClientId,
        bucket: u64,
        id: InvalidationId,
    },
    /// Drop the whole local cache.
    All { client: ClientId, id: InvalidationId },
}

impl ClientInvalidation {
    #[must_use]
    pub fn client(&self) -> ClientId {
        match self {
            Self::Hash { client, .. } | Self::All { client, .. } => *client,
        }
    }

    #[must_use]
    pub fn id(&self) -> InvalidationId {
        match self {
            Self::Hash { id, .. } | Self::All { id, .. } => *id,
        }
    }
}

/// Delivery seam for invalidation requests.
///
/// Implementations must not block: they are called while the ordering gate
/// for the mutated bucket is held.
pub trait ClientNotifier: Send + Sync {
    fn invalidate_hash(&self, client: ClientId, bucket: u64, id: InvalidationId);

    fn invalidate_all(&self, client: ClientId, id: InvalidationId);
}

/// [`ClientNotifier`] backed by an unbounded tokio channel.
///
/// Requests sent after the receiver is dropped are discarded; the matching
/// responder is released when its client is detached.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<ClientInvalidation>,
}

impl ChannelNotifier {
    /// Creates a notifier and the receiver the network layer drains.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientInvalidation>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, request: ClientInvalidation) {
        if self.tx.send(request).is_err() {
            debug!(client = %request.client(), "invalidation receiver dropped; request discarded");
        }
    }
}

impl ClientNotifier for ChannelNotifier {
    fn invalidate_hash(&self, client: ClientId, bucket: u64, id: InvalidationId) {
        self.send(ClientInvalidation::Hash { client, bucket, id });
    }

    fn invalidate_all(&self, client: ClientId, id: InvalidationId) {
        self.send(ClientInvalidation::All { client, id });
    }
}
