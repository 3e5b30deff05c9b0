//! In-memory [`ChainStorage`] implementation backed by [`DashMap`].
//!
//! Per-bucket atomicity comes from `DashMap`'s shard locks: append and the
//! head swap both run inside a single entry guard.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tiercache_core::chain::UNSEQUENCED;
use tiercache_core::{Chain, Element};

use crate::storage::engine::{ChainStorage, FetchResult, IterationCursor, ReplaceOutcome};

/// In-memory chain storage backed by [`DashMap`].
pub struct HashMapChainStorage {
    chains: DashMap<u64, Chain>,
    next_sequence: AtomicU64,
}

impl HashMapChainStorage {
    #[must_use]
    pub fn new() -> Self {
        Self {
            chains: DashMap::new(),
            next_sequence: AtomicU64::new(UNSEQUENCED + 1),
        }
    }

    fn allocate_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Makes sure future sequences sort after everything in `chain`.
    fn observe_sequences(&self, chain: &Chain) {
        let floor = chain.max_sequence().saturating_add(1);
        self.next_sequence.fetch_max(floor, Ordering::Relaxed);
    }
}

impl Default for HashMapChainStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes a cursor's opaque state into a `u64` offset.
///
/// Empty state (from `IterationCursor::start()`) is treated as offset 0.
fn decode_cursor_offset(cursor: &IterationCursor) -> u64 {
    if cursor.state.is_empty() {
        0
    } else {
        let mut buf = [0u8; 8];
        let len = cursor.state.len().min(8);
        buf[..len].copy_from_slice(&cursor.state[..len]);
        u64::from_le_bytes(buf)
    }
}

fn encode_cursor_offset(offset: u64) -> Vec<u8> {
    offset.to_le_bytes().to_vec()
}

impl ChainStorage for HashMapChainStorage {
    fn append(&self, bucket: u64, payload: Vec<u8>) -> Chain {
        let mut chain = self.chains.entry(bucket).or_default();
        chain.push(Element::with_sequence(self.allocate_sequence(), payload));
        chain.clone()
    }

    fn get(&self, bucket: u64) -> Option<Chain> {
        self.chains.get(&bucket).map(|c| c.clone())
    }

    fn replace_at_head(
        &self,
        bucket: u64,
        expected: &Chain,
        replacement: Chain,
    ) -> ReplaceOutcome {
        match self.chains.entry(bucket) {
            Entry::Occupied(mut occupied) => {
                if !expected.is_head_of(occupied.get()) {
                    return ReplaceOutcome::Stale;
                }
                let mut next = Chain::empty();
                for element in replacement.elements() {
                    next.push(element.resequenced(self.allocate_sequence()));
                }
                for element in &occupied.get().elements()[expected.len()..] {
                    next.push(element.clone());
                }
                if next.is_empty() {
                    let (_, old) = occupied.remove_entry();
                    ReplaceOutcome::Removed { old }
                } else {
                    let old = occupied.insert(next.clone());
                    ReplaceOutcome::Replaced { old, new: next }
                }
            }
            Entry::Vacant(vacant) => {
                if !expected.is_empty() {
                    return ReplaceOutcome::Stale;
                }
                if replacement.is_empty() {
                    return ReplaceOutcome::Removed { old: Chain::empty() };
                }
                let mut next = Chain::empty();
                for element in replacement.elements() {
                    next.push(element.resequenced(self.allocate_sequence()));
                }
                vacant.insert(next.clone());
                ReplaceOutcome::Replaced {
                    old: Chain::empty(),
                    new: next,
                }
            }
        }
    }

    fn install(&self, bucket: u64, chain: Chain) -> Option<Chain> {
        if chain.is_empty() {
            return self.remove(bucket);
        }
        self.observe_sequences(&chain);
        let chain = if chain.elements().iter().any(|e| e.sequence() == UNSEQUENCED) {
            Chain::from_elements(
                chain
                    .elements()
                    .iter()
                    .map(|e| {
                        if e.sequence() == UNSEQUENCED {
                            e.resequenced(self.allocate_sequence())
                        } else {
                            e.clone()
                        }
                    })
                    .collect(),
            )
        } else {
            chain
        };
        self.chains.insert(bucket, chain)
    }

    fn remove(&self, bucket: u64) -> Option<Chain> {
        self.chains.remove(&bucket).map(|(_, c)| c)
    }

    fn contains(&self, bucket: u64) -> bool {
        self.chains.contains_key(&bucket)
    }

    fn len(&self) -> usize {
        self.chains.len()
    }

    fn capacity(&self) -> usize {
        self.chains.capacity()
    }

    fn clear(&self) -> Vec<(u64, Chain)> {
        let buckets: Vec<u64> = self.chains.iter().map(|e| *e.key()).collect();
        buckets
            .into_iter()
            .filter_map(|bucket| self.chains.remove(&bucket))
            .collect()
    }

    fn snapshot_iter(&self) -> Vec<(u64, Chain)> {
        let mut snapshot: Vec<(u64, Chain)> = self
            .chains
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        snapshot.sort_unstable_by_key(|(bucket, _)| *bucket);
        snapshot
    }

    fn fetch_chains(&self, cursor: &IterationCursor, size: usize) -> FetchResult<(u64, Chain)> {
        let snapshot = self.snapshot_iter();
        let total = snapshot.len();
        // Cursor offsets are bounded by storage size, so truncation is safe.
        #[allow(clippy::cast_possible_truncation)]
        let offset = decode_cursor_offset(cursor) as usize;

        let items: Vec<(u64, Chain)> = snapshot.into_iter().skip(offset).take(size).collect();

        let new_offset = offset + items.len();
        let finished = new_offset >= total;

        FetchResult {
            items,
            next_cursor: IterationCursor {
                state: encode_cursor_offset(new_offset as u64),
                finished,
            },
        }
    }
}
