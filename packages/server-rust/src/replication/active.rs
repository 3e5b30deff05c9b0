//! Active side of the replication channel.
//!
//! [`ActiveReplicator`] turns tier events into [`ReplicationMessage`]s and
//! hands them to the transport. Callers must already hold the ordering gate
//! for the message's concurrency key, which is what keeps per-bucket order on
//! the passive equal to issue order.

use std::sync::Arc;

use tiercache_core::Chain;
use tokio::sync::mpsc;
use tracing::error;

use super::error::ReplicationError;
use super::messages::ReplicationMessage;
use super::transport::{ReplicationReceipt, ReplicationTransport};
use crate::clients::ClientId;
use crate::config::ReplicationMode;

/// An asynchronous replication that the passive failed to apply.
///
/// Published on the failover signal channel returned by
/// [`ActiveReplicator::new`]; the passive can no longer be trusted to take
/// over without a resync.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationFailure {
    pub kind: &'static str,
    pub error: ReplicationError,
}

/// A sent message whose outcome has not been observed yet.
#[must_use = "a pending replication must be settled"]
pub struct PendingReplication {
    kind: &'static str,
    receipt: ReplicationReceipt,
    mode: ReplicationMode,
    failures: mpsc::UnboundedSender<ReplicationFailure>,
}

impl PendingReplication {
    /// Settles according to the replication mode.
    ///
    /// `Sync` waits for the passive's verdict. `Async` returns immediately
    /// and watches the receipt in the background, logging and signalling a
    /// failure instead of returning it.
    ///
    /// # Errors
    ///
    /// In `Sync` mode, returns the passive's apply error.
    pub async fn settle(self) -> Result<(), ReplicationError> {
        match self.mode {
            ReplicationMode::Sync => self.receipt.wait().await,
            ReplicationMode::Async => {
                let Self {
                    kind,
                    receipt,
                    failures,
                    ..
                } = self;
                tokio::spawn(async move {
                    if let Err(error) = receipt.wait().await {
                        error!(kind, error = %error, "asynchronous replication failed");
                        let _ = failures.send(ReplicationFailure { kind, error });
                    }
                });
                Ok(())
            }
        }
    }
}

/// Sends replication traffic for the active node.
pub struct ActiveReplicator {
    transport: Arc<dyn ReplicationTransport>,
    mode: ReplicationMode,
    failures: mpsc::UnboundedSender<ReplicationFailure>,
}

impl ActiveReplicator {
    /// Creates a replicator and the failover signal receiver.
    #[must_use]
    pub fn new(
        transport: Arc<dyn ReplicationTransport>,
        mode: ReplicationMode,
    ) -> (Self, mpsc::UnboundedReceiver<ReplicationFailure>) {
        let (failures, rx) = mpsc::unbounded_channel();
        (
            Self {
                transport,
                mode,
                failures,
            },
            rx,
        )
    }

    #[must_use]
    pub fn mode(&self) -> ReplicationMode {
        self.mode
    }

    async fn send(&self, message: ReplicationMessage) -> Result<PendingReplication, ReplicationError> {
        let kind = message.kind_name();
        let receipt = self.transport.send(message).await?;
        Ok(PendingReplication {
            kind,
            receipt,
            mode: self.mode,
            failures: self.failures.clone(),
        })
    }

    /// Ships the full chain of `bucket` after a client append, along with
    /// the client's dedup watermark.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot accept the message.
    pub async fn replicate_append(
        &self,
        bucket: u64,
        chain: Chain,
        client_id: ClientId,
        message_id: u64,
        oldest_outstanding: u64,
    ) -> Result<PendingReplication, ReplicationError> {
        self.send(ReplicationMessage::ChainReplication {
            bucket,
            chain,
            client_id,
            message_id,
            oldest_outstanding,
        })
        .await
    }

    /// Registers a client identity with the passive. Must be sent under the
    /// global ordering point, before any chain message from that client.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot accept the message.
    pub async fn replicate_client_attach(
        &self,
        client_id: ClientId,
    ) -> Result<PendingReplication, ReplicationError> {
        self.send(ReplicationMessage::ClientIdTrack { client_id })
            .await
    }

    /// Ships a client's clear of the whole store.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot accept the message.
    pub async fn replicate_clear(
        &self,
        client_id: ClientId,
        message_id: u64,
        oldest_outstanding: u64,
    ) -> Result<PendingReplication, ReplicationError> {
        self.send(ReplicationMessage::ClearReplication {
            client_id,
            message_id,
            oldest_outstanding,
        })
        .await
    }

    /// Tells the passive the invalidation for `bucket` has finished.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot accept the message.
    pub async fn replicate_invalidation_complete(
        &self,
        bucket: u64,
    ) -> Result<PendingReplication, ReplicationError> {
        self.send(ReplicationMessage::InvalidationComplete { bucket })
            .await
    }

    /// Tells the passive the clear-all invalidation has finished.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot accept the message.
    pub async fn replicate_clear_invalidation_complete(
        &self,
    ) -> Result<PendingReplication, ReplicationError> {
        self.send(ReplicationMessage::ClearInvalidationComplete)
            .await
    }
}
