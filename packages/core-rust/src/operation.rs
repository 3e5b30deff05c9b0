//! Logged mutation operations.
//!
//! An [`Operation`] is one entry of a chain. It is immutable once appended:
//! chains only ever grow by appending new operations or get replaced as a
//! whole by a compacted equivalent.

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::types::Key;

/// Kind of a logged mutation, with its stable one-byte wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Put,
    Remove,
    Replace,
    ConditionalReplace,
    ConditionalRemove,
}

impl OperationKind {
    /// Wire code stored in encoded chain elements.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Put => 1,
            Self::Remove => 2,
            Self::Replace => 3,
            Self::ConditionalReplace => 4,
            Self::ConditionalRemove => 5,
        }
    }

    /// Decodes a wire code. Returns `None` for unknown codes.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Put),
            2 => Some(Self::Remove),
            3 => Some(Self::Replace),
            4 => Some(Self::ConditionalReplace),
            5 => Some(Self::ConditionalRemove),
            _ => None,
        }
    }

    /// Whether operations of this kind carry a value to write.
    #[must_use]
    pub fn writes_value(self) -> bool {
        matches!(
            self,
            Self::Put | Self::Replace | Self::ConditionalReplace
        )
    }

    /// Whether operations of this kind carry an expected value.
    #[must_use]
    pub fn is_conditional(self) -> bool {
        matches!(self, Self::ConditionalReplace | Self::ConditionalRemove)
    }
}

/// A single logged mutation.
///
/// Construct through the kind-specific constructors so that `value` and
/// `expected` are present exactly when the kind requires them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    kind: OperationKind,
    key: Key,
    value: Option<Vec<u8>>,
    expected: Option<Vec<u8>>,
    timestamp: Timestamp,
}

impl Operation {
    /// Unconditional write of `value`.
    #[must_use]
    pub fn put(key: Key, value: Vec<u8>, timestamp: Timestamp) -> Self {
        Self {
            kind: OperationKind::Put,
            key,
            value: Some(value),
            expected: None,
            timestamp,
        }
    }

    /// Unconditional removal.
    #[must_use]
    pub fn remove(key: Key, timestamp: Timestamp) -> Self {
        Self {
            kind: OperationKind::Remove,
            key,
            value: None,
            expected: None,
            timestamp,
        }
    }

    /// Overwrite with `value`.
    #[must_use]
    pub fn replace(key: Key, value: Vec<u8>, timestamp: Timestamp) -> Self {
        Self {
            kind: OperationKind::Replace,
            key,
            value: Some(value),
            expected: None,
            timestamp,
        }
    }

    /// Write `value` only if the running value equals `expected`.
    #[must_use]
    pub fn conditional_replace(
        key: Key,
        expected: Vec<u8>,
        value: Vec<u8>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            kind: OperationKind::ConditionalReplace,
            key,
            value: Some(value),
            expected: Some(expected),
            timestamp,
        }
    }

    /// Remove only if the running value equals `expected`.
    #[must_use]
    pub fn conditional_remove(key: Key, expected: Vec<u8>, timestamp: Timestamp) -> Self {
        Self {
            kind: OperationKind::ConditionalRemove,
            key,
            value: None,
            expected: Some(expected),
            timestamp,
        }
    }

    /// Reassembles an operation from decoded parts.
    ///
    /// Returns `None` when the presence of `value`/`expected` does not match
    /// what `kind` requires.
    #[must_use]
    pub fn from_parts(
        kind: OperationKind,
        key: Key,
        value: Option<Vec<u8>>,
        expected: Option<Vec<u8>>,
        timestamp: Timestamp,
    ) -> Option<Self> {
        if kind.writes_value() != value.is_some() || kind.is_conditional() != expected.is_some() {
            return None;
        }
        Some(Self {
            kind,
            key,
            value,
            expected,
            timestamp,
        })
    }

    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    #[must_use]
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Value written by this operation, if its kind writes one.
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Expected running value for conditional kinds.
    #[must_use]
    pub fn expected(&self) -> Option<&[u8]> {
        self.expected.as_deref()
    }

    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Applies this operation to the running value of its key.
    ///
    /// Returns `None` when the operation is a no-op (a conditional whose
    /// expectation does not hold), otherwise the new running value.
    #[must_use]
    pub fn apply(&self, running: Option<&[u8]>) -> Option<Option<Vec<u8>>> {
        match self.kind {
            OperationKind::Put | OperationKind::Replace => Some(self.value.clone()),
            OperationKind::Remove => Some(None),
            OperationKind::ConditionalReplace => {
                (running == self.expected.as_deref()).then(|| self.value.clone())
            }
            OperationKind::ConditionalRemove => {
                (running == self.expected.as_deref()).then_some(None)
            }
        }
    }
}
