//! Replication transport seam and the in-process implementation.
//!
//! The active only sees [`ReplicationTransport`]. Network framing lives
//! outside this crate; [`InProcessTransport`] wires an active directly to a
//! [`PassiveReplica`] through a single FIFO worker queue, so messages are
//! applied in exactly the order they were sent.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tracing::{trace, warn};

use super::error::ReplicationError;
use super::messages::ReplicationMessage;
use super::passive::PassiveReplica;
use crate::service::worker::{BackgroundRunnable, BackgroundWorker};

/// The applier never needs periodic work; the tick only has to be finite.
const APPLIER_TICK_MS: u64 = 3_600_000;

/// Completion handle for one replicated message.
///
/// Resolves once the passive has applied the message (or failed to).
#[derive(Debug)]
pub struct ReplicationReceipt {
    rx: oneshot::Receiver<Result<(), ReplicationError>>,
}

impl ReplicationReceipt {
    #[must_use]
    pub fn new(rx: oneshot::Receiver<Result<(), ReplicationError>>) -> Self {
        Self { rx }
    }

    /// A receipt that is already settled with `result`.
    #[must_use]
    pub fn settled(result: Result<(), ReplicationError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Waits for the passive's verdict.
    ///
    /// # Errors
    ///
    /// Returns the passive's apply error, or
    /// [`ReplicationError::TransportClosed`] if the transport went away
    /// before answering.
    pub async fn wait(self) -> Result<(), ReplicationError> {
        self.rx
            .await
            .unwrap_or(Err(ReplicationError::TransportClosed))
    }
}

/// Outbound channel from the active to its passive.
///
/// `send` returns once the message is queued; the returned receipt settles
/// when it has been applied. Used as `Arc<dyn ReplicationTransport>`.
#[async_trait]
pub trait ReplicationTransport: Send + Sync {
    /// Queues `message` for the passive.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded or the transport is
    /// closed.
    async fn send(
        &self,
        message: ReplicationMessage,
    ) -> Result<ReplicationReceipt, ReplicationError>;
}

/// Encoded message plus the channel its verdict goes back on.
pub struct ApplyTask {
    payload: Vec<u8>,
    ack: oneshot::Sender<Result<(), ReplicationError>>,
}

/// Worker-side half of [`InProcessTransport`].
pub struct PassiveApplier {
    replica: Arc<PassiveReplica>,
}

#[async_trait]
impl BackgroundRunnable for PassiveApplier {
    type Task = ApplyTask;

    async fn run(&mut self, task: ApplyTask) {
        let result = ReplicationMessage::decode(&task.payload)
            .and_then(|message| self.replica.apply(&message));
        if let Err(e) = &result {
            warn!(error = %e, "passive rejected replication message");
        }
        // The sender may have stopped waiting (async replication).
        let _ = task.ack.send(result);
    }
}

/// [`ReplicationTransport`] that applies messages to an in-process
/// [`PassiveReplica`].
pub struct InProcessTransport {
    worker: Mutex<BackgroundWorker<PassiveApplier>>,
}

impl InProcessTransport {
    /// Starts the applier worker. Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(replica: Arc<PassiveReplica>, queue_capacity: usize) -> Self {
        let worker = BackgroundWorker::start_with_capacity(
            PassiveApplier { replica },
            APPLIER_TICK_MS,
            queue_capacity,
        );
        Self {
            worker: Mutex::new(worker),
        }
    }

    /// Stops the applier. Queued messages that were not applied yet settle
    /// their receipts with [`ReplicationError::TransportClosed`].
    pub async fn stop(&self) {
        self.worker.lock().await.stop().await;
    }
}

#[async_trait]
impl ReplicationTransport for InProcessTransport {
    async fn send(
        &self,
        message: ReplicationMessage,
    ) -> Result<ReplicationReceipt, ReplicationError> {
        let payload = message.encode()?;
        trace!(kind = message.kind_name(), bytes = payload.len(), "queueing replication message");
        let (ack, rx) = oneshot::channel();
        self.worker
            .lock()
            .await
            .submit(ApplyTask { payload, ack })
            .await
            .map_err(|_| ReplicationError::TransportClosed)?;
        Ok(ReplicationReceipt::new(rx))
    }
}
