//! Background chain compaction.
//!
//! Reads compact lazily, but a bucket that is written often and read rarely
//! would grow without bound. The compaction worker handles those: the tier
//! submits a bucket once its chain reaches the threshold, and every tick
//! sweeps all oversized buckets.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::worker::{BackgroundRunnable, BackgroundWorker};
use crate::storage::{Compaction, ServerSideStore};

/// Work items for the compaction worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionTask {
    /// Compact one bucket.
    Bucket(u64),
    /// Compact every bucket at or above the threshold.
    Sweep,
}

/// Compaction task handler.
pub struct CompactionRunnable {
    store: Arc<ServerSideStore>,
}

impl CompactionRunnable {
    #[must_use]
    pub fn new(store: Arc<ServerSideStore>) -> Self {
        Self { store }
    }

    fn compact(&self, bucket: u64) {
        match self.store.compact(bucket) {
            Ok(Compaction::Compacted { before, after }) => {
                debug!(bucket, before, after, "chain compacted");
            }
            Ok(Compaction::Lost) => {
                // A writer got there first; the next sweep or read retries.
                debug!(bucket, "compaction lost the race");
            }
            Ok(Compaction::Skipped) => {}
            Err(e) => warn!(bucket, error = %e, "compaction failed"),
        }
    }

    fn sweep(&self) {
        for bucket in self.store.oversized_buckets() {
            self.compact(bucket);
        }
    }
}

#[async_trait]
impl BackgroundRunnable for CompactionRunnable {
    type Task = CompactionTask;

    async fn run(&mut self, task: CompactionTask) {
        match task {
            CompactionTask::Bucket(bucket) => self.compact(bucket),
            CompactionTask::Sweep => self.sweep(),
        }
    }

    async fn on_tick(&mut self) {
        self.sweep();
    }
}

/// Shareable handle to a running compaction worker.
pub struct CompactionService {
    worker: Mutex<Option<BackgroundWorker<CompactionRunnable>>>,
}

impl CompactionService {
    /// Starts the worker. Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(store: Arc<ServerSideStore>, sweep_interval_ms: u64) -> Self {
        let worker = BackgroundWorker::start(CompactionRunnable::new(store), sweep_interval_ms);
        Self {
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queues a bucket for compaction without waiting.
    ///
    /// Returns `false` if the task was dropped (queue full or worker
    /// stopped). Dropped requests are harmless: the periodic sweep picks
    /// the bucket up.
    pub fn request(&self, bucket: u64) -> bool {
        self.submit(CompactionTask::Bucket(bucket))
    }

    /// Queues a full sweep without waiting.
    pub fn request_sweep(&self) -> bool {
        self.submit(CompactionTask::Sweep)
    }

    fn submit(&self, task: CompactionTask) -> bool {
        let guard = self.worker.lock();
        let Some(worker) = guard.as_ref() else {
            return false;
        };
        match worker.try_submit(task) {
            Ok(()) => true,
            Err(e) => {
                warn!(?task, error = %e, "compaction task dropped");
                false
            }
        }
    }

    /// Stops the worker and waits for it to finish. Idempotent.
    pub async fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            worker.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tiercache_core::{Key, Operation, Timestamp};

    use super::*;
    use crate::storage::{CompositeStoreObserver, HashMapChainStorage};

    fn store_with_long_chain(threshold: usize, len: u64) -> (Arc<ServerSideStore>, u64) {
        let store = Arc::new(ServerSideStore::new(
            Arc::new(HashMapChainStorage::new()),
            threshold,
            Arc::new(CompositeStoreObserver::default()),
        ));
        let key = Key::from("hot");
        let bucket = key.bucket_hash();
        for i in 0..len {
            let op = Operation::put(key.clone(), i.to_le_bytes().to_vec(), Timestamp {
                millis: i,
                counter: 0,
            });
            store.append(bucket, &op).unwrap();
        }
        (store, bucket)
    }

    async fn wait_for_len(store: &ServerSideStore, bucket: u64, len: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.get(bucket).len() != len {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn requested_bucket_is_compacted() {
        let (store, bucket) = store_with_long_chain(4, 6);
        let service = CompactionService::start(Arc::clone(&store), 60_000);

        assert!(service.request(bucket));
        wait_for_len(&store, bucket, 1).await;

        service.stop().await;
    }

    #[tokio::test]
    async fn tick_sweeps_oversized_buckets() {
        let (store, bucket) = store_with_long_chain(4, 6);
        let service = CompactionService::start(Arc::clone(&store), 10);

        wait_for_len(&store, bucket, 1).await;

        service.stop().await;
    }

    #[tokio::test]
    async fn requests_after_stop_are_dropped() {
        let (store, bucket) = store_with_long_chain(4, 2);
        let service = CompactionService::start(store, 60_000);
        service.stop().await;
        service.stop().await;

        assert!(!service.request(bucket));
        assert!(!service.request_sweep());
    }
}
