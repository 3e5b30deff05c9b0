//! Store observer trait and composite implementation.
//!
//! Defines [`StoreObserver`] for reacting to structural changes in a
//! [`ServerSideStore`](super::ServerSideStore), and [`CompositeStoreObserver`]
//! which fans out notifications to multiple observers. The pool/accounting
//! collaborator plugs in here.

use std::sync::Arc;

use super::stats::StoreStats;

/// A structural change to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreChange {
    /// One element was appended to `bucket`.
    Appended { bucket: u64 },
    /// The head of `bucket`'s chain was swapped for a compacted form.
    Compacted { bucket: u64 },
    /// `bucket` was overwritten wholesale (replication apply).
    Installed { bucket: u64 },
    /// `bucket` was dropped.
    Removed { bucket: u64 },
    /// Every bucket was dropped.
    Cleared,
}

/// Observer for store changes.
///
/// Called synchronously after the change is visible, with stats taken
/// immediately afterwards. Used as `Arc<dyn StoreObserver>`.
pub trait StoreObserver: Send + Sync {
    fn on_change(&self, change: &StoreChange, stats: &StoreStats);
}

/// Composite observer that fans out to multiple observers.
#[derive(Default)]
pub struct CompositeStoreObserver {
    observers: Vec<Arc<dyn StoreObserver>>,
}

impl CompositeStoreObserver {
    #[must_use]
    pub fn new(observers: Vec<Arc<dyn StoreObserver>>) -> Self {
        Self { observers }
    }

    /// Adds an observer after construction.
    pub fn add(&mut self, observer: Arc<dyn StoreObserver>) {
        self.observers.push(observer);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl StoreObserver for CompositeStoreObserver {
    fn on_change(&self, change: &StoreChange, stats: &StoreStats) {
        for observer in &self.observers {
            observer.on_change(change, stats);
        }
    }
}
