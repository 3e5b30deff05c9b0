//! Bucket-addressed chain store with lazy compaction on read.
//!
//! [`ServerSideStore`] sits on top of a [`ChainStorage`] engine. Writes only
//! ever append; reads resolve the chain and, once a chain has grown past
//! the compaction threshold, try to swap its head for the compacted form.
//! A lost swap means another writer got there first: the read re-fetches
//! and tries again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tiercache_core::{Chain, ChainError, ChainResolver, Key, Operation, Resolution};
use tracing::{debug, trace};

use super::engine::{ChainStorage, FetchResult, IterationCursor, ReplaceOutcome};
use super::observer::{CompositeStoreObserver, StoreChange, StoreObserver};
use super::stats::StoreStats;

/// Errors raised by the store.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("bucket {bucket:#018x}: {source}")]
    Chain {
        bucket: u64,
        #[source]
        source: ChainError,
    },
}

impl StoreError {
    #[must_use]
    pub fn bucket(&self) -> u64 {
        match self {
            Self::Chain { bucket, .. } => *bucket,
        }
    }
}

/// Result of a single compaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compaction {
    /// The chain head was swapped. Lengths are before and after.
    Compacted { before: usize, after: usize },
    /// Nothing to gain: the chain is absent or already minimal.
    Skipped,
    /// A concurrent writer changed the chain first.
    Lost,
}

/// Chain store for one tier.
pub struct ServerSideStore {
    engine: Arc<dyn ChainStorage>,
    resolver: ChainResolver,
    compaction_threshold: usize,
    occupied_bytes: AtomicU64,
    data_size: AtomicU64,
    observer: Arc<CompositeStoreObserver>,
}

impl ServerSideStore {
    #[must_use]
    pub fn new(
        engine: Arc<dyn ChainStorage>,
        compaction_threshold: usize,
        observer: Arc<CompositeStoreObserver>,
    ) -> Self {
        Self {
            engine,
            resolver: ChainResolver::new(),
            compaction_threshold: compaction_threshold.max(1),
            occupied_bytes: AtomicU64::new(0),
            data_size: AtomicU64::new(0),
            observer,
        }
    }

    #[must_use]
    pub fn compaction_threshold(&self) -> usize {
        self.compaction_threshold
    }

    /// Appends `op` to the bucket's chain and returns the chain after the
    /// append. Never resolves.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Chain`] if the operation cannot be encoded.
    pub fn append(&self, bucket: u64, op: &Operation) -> Result<Chain, StoreError> {
        let payload = tiercache_core::codec::encode_operation(op)
            .map_err(|source| StoreError::Chain { bucket, source })?;
        let bytes = payload.len() as u64;
        let chain = self.engine.append(bucket, payload);

        self.occupied_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.data_size.fetch_add(1, Ordering::Relaxed);
        debug!(bucket, kind = ?op.kind(), chain_len = chain.len(), "appended operation");
        self.notify(StoreChange::Appended { bucket });
        Ok(chain)
    }

    /// Snapshot of the bucket's chain; empty if the bucket is absent.
    #[must_use]
    pub fn get(&self, bucket: u64) -> Chain {
        self.engine.get(bucket).unwrap_or_default()
    }

    /// Compare-and-swap of the chain head.
    ///
    /// Succeeds iff `expected` is still the head of the stored chain.
    /// Elements appended after `expected` was read stay behind `new`. An
    /// empty result removes the bucket. `false` means "re-fetch and retry".
    pub fn replace(&self, bucket: u64, expected: &Chain, new: Chain) -> bool {
        match self.engine.replace_at_head(bucket, expected, new) {
            ReplaceOutcome::Replaced { old, new } => {
                self.account_swap(Some(&old), Some(&new));
                self.notify(StoreChange::Compacted { bucket });
                true
            }
            ReplaceOutcome::Removed { old } => {
                self.account_swap(Some(&old), None);
                self.notify(StoreChange::Removed { bucket });
                true
            }
            ReplaceOutcome::Stale => false,
        }
    }

    /// Drops the bucket. Returns `true` if it existed.
    pub fn remove(&self, bucket: u64) -> bool {
        match self.engine.remove(bucket) {
            Some(old) => {
                self.account_swap(Some(&old), None);
                self.notify(StoreChange::Removed { bucket });
                true
            }
            None => false,
        }
    }

    /// Overwrites the bucket wholesale with a replicated chain.
    pub fn install(&self, bucket: u64, chain: Chain) {
        let installed = chain.clone();
        let old = self.engine.install(bucket, chain);
        let new = (!installed.is_empty()).then_some(&installed);
        self.account_swap(old.as_ref(), new);
        let change = if new.is_some() {
            StoreChange::Installed { bucket }
        } else {
            StoreChange::Removed { bucket }
        };
        self.notify(change);
    }

    /// Drops every bucket. Returns the number of buckets removed.
    pub fn clear(&self) -> usize {
        let removed = self.engine.clear();
        for (_, chain) in &removed {
            self.account_swap(Some(chain), None);
        }
        debug!(buckets = removed.len(), "store cleared");
        self.notify(StoreChange::Cleared);
        removed.len()
    }

    /// Resolves the current value of `key`.
    ///
    /// Chains at or above the compaction threshold are compacted as a side
    /// effect. If the write-back loses a race the chain is re-fetched and
    /// re-resolved.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Chain`] if the bucket holds an undecodable
    /// element. The chain is left untouched.
    pub fn get_value(&self, key: &Key) -> Result<Resolution, StoreError> {
        let bucket = key.bucket_hash();
        loop {
            let chain = self.get(bucket);
            let resolved = self
                .resolver
                .resolve(&chain)
                .map_err(|source| StoreError::Chain { bucket, source })?;
            let resolution = resolved
                .resolution(key)
                .cloned()
                .unwrap_or(Resolution::Absent);

            if chain.len() < self.compaction_threshold
                || resolved.compacted_chain().len() >= chain.len()
            {
                return Ok(resolution);
            }
            if self.replace(bucket, &chain, resolved.into_compacted_chain()) {
                return Ok(resolution);
            }
            trace!(bucket, "compaction on read lost the race; retrying");
        }
    }

    /// Single compaction attempt for `bucket`, regardless of threshold.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Chain`] if the chain cannot be decoded.
    pub fn compact(&self, bucket: u64) -> Result<Compaction, StoreError> {
        let Some(chain) = self.engine.get(bucket) else {
            return Ok(Compaction::Skipped);
        };
        let resolved = self
            .resolver
            .resolve(&chain)
            .map_err(|source| StoreError::Chain { bucket, source })?;
        let after = resolved.compacted_chain().len();
        let before = chain.len();
        if after >= before {
            return Ok(Compaction::Skipped);
        }
        if self.replace(bucket, &chain, resolved.into_compacted_chain()) {
            Ok(Compaction::Compacted { before, after })
        } else {
            Ok(Compaction::Lost)
        }
    }

    /// Buckets whose chain length is at or above the compaction threshold.
    #[must_use]
    pub fn oversized_buckets(&self) -> Vec<u64> {
        self.engine
            .snapshot_iter()
            .into_iter()
            .filter(|(_, chain)| chain.len() >= self.compaction_threshold)
            .map(|(bucket, _)| bucket)
            .collect()
    }

    #[must_use]
    pub fn contains(&self, bucket: u64) -> bool {
        self.engine.contains(bucket)
    }

    /// Number of buckets holding a chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.engine.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.engine.is_empty()
    }

    /// Pages through every bucket in bucket-hash order.
    #[must_use]
    pub fn fetch_chains(&self, cursor: &IterationCursor, size: usize) -> FetchResult<(u64, Chain)> {
        self.engine.fetch_chains(cursor, size)
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        StoreStats::compute(
            self.engine.len() as u64,
            self.engine.capacity() as u64,
            self.occupied_bytes.load(Ordering::Relaxed),
            self.data_size.load(Ordering::Relaxed),
        )
    }

    fn account_swap(&self, old: Option<&Chain>, new: Option<&Chain>) {
        if let Some(new) = new {
            self.occupied_bytes
                .fetch_add(new.payload_bytes(), Ordering::Relaxed);
            self.data_size.fetch_add(new.len() as u64, Ordering::Relaxed);
        }
        if let Some(old) = old {
            self.occupied_bytes
                .fetch_sub(old.payload_bytes(), Ordering::Relaxed);
            self.data_size.fetch_sub(old.len() as u64, Ordering::Relaxed);
        }
    }

    fn notify(&self, change: StoreChange) {
        if self.observer.is_empty() {
            return;
        }
        self.observer.on_change(&change, &self.stats());
    }
}
