//! Single-task background worker with a bounded queue and a periodic tick.
//!
//! Both the replication applier and the compaction service run on this.
//! Tasks are handled one at a time in submission order; the in-process
//! replication transport depends on that for per-bucket ordering on the
//! passive.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Queue capacity used by [`BackgroundWorker::start`].
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Handler driven by a [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    /// Handles one queued task.
    async fn run(&mut self, task: Self::Task);

    /// Runs on every tick. No-op by default.
    async fn on_tick(&mut self) {}

    /// Runs once after the loop exits. No-op by default.
    async fn shutdown(&mut self) {}
}

/// Owns the spawned loop feeding tasks to a [`BackgroundRunnable`].
///
/// The loop exits when [`stop`](Self::stop) is called or every sender is
/// gone. Tasks still queued at that point are dropped without running.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Starts a worker with [`DEFAULT_QUEUE_CAPACITY`].
    pub fn start(runnable: R, tick_interval_ms: u64) -> Self {
        Self::start_with_capacity(runnable, tick_interval_ms, DEFAULT_QUEUE_CAPACITY)
    }

    /// Starts a worker. A zero interval or capacity is raised to 1.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_with_capacity(mut runnable: R, tick_interval_ms: u64, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(capacity.max(1));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(tick_interval_ms.max(1)));
            // First tick completes immediately; consume it so on_tick only
            // fires after a full interval.
            ticker.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => match task {
                        Some(task) => runnable.run(task).await,
                        None => break,
                    },
                    _ = ticker.tick() => runnable.on_tick().await,
                    _ = &mut shutdown_rx => break,
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Queues a task, waiting for room if the queue is full.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        let tx = self.sender()?;
        tx.send(task)
            .await
            .map_err(|_| anyhow::anyhow!("worker channel closed"))
    }

    /// Queues a task without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped or the queue is full.
    pub fn try_submit(&self, task: R::Task) -> anyhow::Result<()> {
        let tx = self.sender()?;
        tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => anyhow::anyhow!("worker queue full"),
            mpsc::error::TrySendError::Closed(_) => anyhow::anyhow!("worker channel closed"),
        })
    }

    fn sender(&self) -> anyhow::Result<&mpsc::Sender<R::Task>> {
        self.tx
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("worker not running"))
    }

    /// `true` until [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.tx.is_some()
    }

    /// Stops the loop and waits for [`BackgroundRunnable::shutdown`] to
    /// return. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
