//! Low-level chain storage trait and cursor-based iteration types.
//!
//! Defines [`ChainStorage`], the innermost storage layer: a concurrent map
//! from bucket hash to [`Chain`] that knows how to append, swap a chain head
//! atomically, and iterate. It never decodes or resolves chain contents;
//! that is the job of [`ServerSideStore`](super::ServerSideStore).

use tiercache_core::Chain;

/// Opaque cursor for resumable iteration over storage entries.
///
/// Implementations encode their internal position in the `state` field.
/// Consumers should treat `state` as opaque and only check `finished`.
#[derive(Debug, Clone)]
pub struct IterationCursor {
    /// Opaque state for the storage implementation to resume iteration.
    pub state: Vec<u8>,
    /// Whether iteration has completed (no more entries).
    pub finished: bool,
}

impl IterationCursor {
    /// Creates a cursor positioned at the beginning of the storage.
    #[must_use]
    pub fn start() -> Self {
        Self {
            state: Vec::new(),
            finished: false,
        }
    }
}

/// Result of a cursor-based fetch operation.
#[derive(Debug)]
pub struct FetchResult<T> {
    pub items: Vec<T>,
    /// Cursor for the next call.
    pub next_cursor: IterationCursor,
}

/// Outcome of [`ChainStorage::replace_at_head`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// The head matched and the bucket now holds `new`.
    Replaced { old: Chain, new: Chain },
    /// The head matched and the result was empty, so the bucket was dropped.
    Removed { old: Chain },
    /// The expected chain is no longer the head of the stored chain.
    Stale,
}

impl ReplaceOutcome {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        !matches!(self, Self::Stale)
    }
}

/// Concurrent bucket → chain map.
///
/// All operations are synchronous and individually atomic per bucket.
/// Wrapped in `Arc<dyn ChainStorage>` for sharing across async boundaries.
pub trait ChainStorage: Send + Sync + 'static {
    /// Appends an encoded operation to the bucket's chain, creating the chain
    /// if needed. The element is assigned a fresh sequence. Returns the chain
    /// as it stands after the append.
    fn append(&self, bucket: u64, payload: Vec<u8>) -> Chain;

    /// Snapshot of the bucket's chain, or `None` if the bucket is absent.
    fn get(&self, bucket: u64) -> Option<Chain>;

    /// Atomically swaps the leading `expected` elements of the stored chain
    /// for `replacement`, keeping any elements appended after `expected` was
    /// read. Replacement elements receive fresh sequences.
    fn replace_at_head(&self, bucket: u64, expected: &Chain, replacement: Chain)
        -> ReplaceOutcome;

    /// Overwrites the bucket wholesale, keeping the chain's own sequences.
    /// An empty chain removes the bucket. Returns the previous chain.
    fn install(&self, bucket: u64, chain: Chain) -> Option<Chain>;

    /// Removes the bucket, returning its chain.
    fn remove(&self, bucket: u64) -> Option<Chain>;

    fn contains(&self, bucket: u64) -> bool;

    /// Number of buckets holding a chain.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of bucket slots currently allocated by the table.
    fn capacity(&self) -> usize;

    /// Drops every chain. Returns the removed chains.
    fn clear(&self) -> Vec<(u64, Chain)>;

    /// Point-in-time snapshot of all buckets, ordered by bucket hash.
    ///
    /// The snapshot is mutation-tolerant (concurrent modifications do not fail).
    fn snapshot_iter(&self) -> Vec<(u64, Chain)>;

    /// Fetches up to `size` buckets starting from `cursor`.
    fn fetch_chains(&self, cursor: &IterationCursor, size: usize) -> FetchResult<(u64, Chain)>;
}
