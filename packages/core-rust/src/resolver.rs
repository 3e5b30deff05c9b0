//! Chain resolution and compaction.
//!
//! [`ChainResolver::resolve`] folds a chain oldest-first, independently per
//! key, and produces a [`ResolvedChain`]: the resolution of every key that
//! appears in the chain plus a compacted chain holding at most one PUT per
//! key. Conditional operations are evaluated against the running in-chain
//! value, never against any state outside the chain.
//!
//! Resolution is pure. The input chain is never modified; callers decide
//! whether to commit the compacted chain back into a store.

use std::collections::{BTreeMap, HashMap};

use tracing::trace;

use crate::chain::Chain;
use crate::clock::Timestamp;
use crate::codec::ChainError;
use crate::operation::Operation;
use crate::types::{Key, Resolution};

/// Result of resolving a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedChain {
    compacted: Chain,
    compacted_operations: Vec<Operation>,
    resolutions: BTreeMap<Key, Resolution>,
}

impl ResolvedChain {
    /// The semantically equivalent compacted chain (unsequenced elements).
    #[must_use]
    pub fn compacted_chain(&self) -> &Chain {
        &self.compacted
    }

    /// The terminal operations of the compacted chain, in chain order.
    #[must_use]
    pub fn compacted_operations(&self) -> &[Operation] {
        &self.compacted_operations
    }

    /// Resolution for `key`, or `None` if the key does not occur in the chain.
    #[must_use]
    pub fn resolution(&self, key: &Key) -> Option<&Resolution> {
        self.resolutions.get(key)
    }

    /// Resolutions of every key that occurs in the chain.
    #[must_use]
    pub fn resolutions(&self) -> &BTreeMap<Key, Resolution> {
        &self.resolutions
    }

    /// `true` when no key ends with a value, so the bucket can be dropped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.compacted.is_empty()
    }

    #[must_use]
    pub fn into_compacted_chain(self) -> Chain {
        self.compacted
    }
}

/// Running state of one key during the fold.
struct KeyFold {
    value: Option<Vec<u8>>,
    last_applied: usize,
    timestamp: Timestamp,
}

/// Stateless chain resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainResolver;

impl ChainResolver {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Resolves `chain` into per-key resolutions and a compacted chain.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::MalformedChain`] if any element cannot be
    /// decoded. Nothing is guessed for a chain that fails to decode.
    pub fn resolve(&self, chain: &Chain) -> Result<ResolvedChain, ChainError> {
        let operations = chain.operations()?;
        let mut folds: HashMap<&Key, KeyFold> = HashMap::new();

        for (position, op) in operations.iter().enumerate() {
            let fold = folds.entry(op.key()).or_insert(KeyFold {
                value: None,
                last_applied: position,
                timestamp: op.timestamp(),
            });
            if let Some(next) = op.apply(fold.value.as_deref()) {
                fold.value = next;
                fold.last_applied = position;
                fold.timestamp = op.timestamp();
            }
        }

        let mut survivors: Vec<(usize, Operation)> = Vec::new();
        let mut resolutions = BTreeMap::new();
        for (key, fold) in folds {
            match fold.value {
                Some(value) => {
                    resolutions.insert(key.clone(), Resolution::Present(value.clone()));
                    survivors.push((
                        fold.last_applied,
                        Operation::put(key.clone(), value, fold.timestamp),
                    ));
                }
                None => {
                    resolutions.insert(key.clone(), Resolution::Absent);
                }
            }
        }
        // Positions are unique per key, so this order is total and stable.
        survivors.sort_unstable_by_key(|(position, _)| *position);
        let compacted_operations: Vec<Operation> =
            survivors.into_iter().map(|(_, op)| op).collect();
        let compacted = Chain::from_operations(&compacted_operations)?;

        trace!(
            input_len = chain.len(),
            compacted_len = compacted.len(),
            keys = resolutions.len(),
            "chain resolved"
        );

        Ok(ResolvedChain {
            compacted,
            compacted_operations,
            resolutions,
        })
    }
}

/// Convenience wrapper around [`ChainResolver::resolve`].
///
/// # Errors
///
/// See [`ChainResolver::resolve`].
pub fn resolve(chain: &Chain) -> Result<ResolvedChain, ChainError> {
    ChainResolver.resolve(chain)
}
