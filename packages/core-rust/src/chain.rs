//! Append-only operation chains.
//!
//! A [`Chain`] is the ordered log of encoded operations for one bucket. Each
//! [`Element`] carries a store-assigned sequence number that acts as its
//! identity: two chains share a head exactly when their leading elements
//! carry the same sequences, which is what the store's compare-and-swap
//! checks before committing a compacted chain.

use serde::{Deserialize, Serialize};

use crate::codec::{decode_operation, encode_operation, ChainError};
use crate::operation::Operation;

/// Sequence value of an element that has not been committed to a store yet.
pub const UNSEQUENCED: u64 = 0;

/// One encoded operation within a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    sequence: u64,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

impl Element {
    /// Creates an element that has not yet been assigned a sequence.
    #[must_use]
    pub fn unsequenced(payload: Vec<u8>) -> Self {
        Self {
            sequence: UNSEQUENCED,
            payload,
        }
    }

    /// Creates an element with an explicit sequence.
    #[must_use]
    pub fn with_sequence(sequence: u64, payload: Vec<u8>) -> Self {
        Self { sequence, payload }
    }

    /// Encodes `op` into an unsequenced element.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Encode`] if the operation cannot be serialized.
    pub fn from_operation(op: &Operation) -> Result<Self, ChainError> {
        Ok(Self::unsequenced(encode_operation(op)?))
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns a copy of this element carrying `sequence`.
    #[must_use]
    pub fn resequenced(&self, sequence: u64) -> Self {
        Self {
            sequence,
            payload: self.payload.clone(),
        }
    }
}

/// Ordered sequence of elements for one bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    elements: Vec<Element>,
}

impl Chain {
    /// Returns an empty chain.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_elements(elements: Vec<Element>) -> Self {
        Self { elements }
    }

    /// Encodes a list of operations into an unsequenced chain.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Encode`] if any operation cannot be serialized.
    pub fn from_operations(ops: &[Operation]) -> Result<Self, ChainError> {
        let elements = ops
            .iter()
            .map(Element::from_operation)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { elements })
    }

    #[must_use]
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Appends an element in place.
    ///
    /// Only the owning store calls this, on the copy it holds privately.
    pub fn push(&mut self, element: Element) {
        self.elements.push(element);
    }

    /// Total payload bytes held by this chain.
    #[must_use]
    pub fn payload_bytes(&self) -> u64 {
        self.elements.iter().map(|e| e.payload.len() as u64).sum()
    }

    /// Highest sequence carried by any element, or [`UNSEQUENCED`].
    #[must_use]
    pub fn max_sequence(&self) -> u64 {
        self.elements
            .iter()
            .map(Element::sequence)
            .max()
            .unwrap_or(UNSEQUENCED)
    }

    /// Returns `true` if this chain's elements are the leading elements of
    /// `other`, compared by sequence identity.
    #[must_use]
    pub fn is_head_of(&self, other: &Chain) -> bool {
        self.elements.len() <= other.elements.len()
            && self
                .elements
                .iter()
                .zip(&other.elements)
                .all(|(a, b)| a.sequence == b.sequence && a.sequence != UNSEQUENCED)
    }

    /// Decodes every element into an operation, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::MalformedChain`] for the first element that
    /// fails to decode.
    pub fn operations(&self) -> Result<Vec<Operation>, ChainError> {
        self.elements
            .iter()
            .enumerate()
            .map(|(position, e)| decode_operation(&e.payload, position))
            .collect()
    }
}
