//! Encoding of operations into chain element payloads.
//!
//! Chain elements hold operations as opaque `MsgPack` bytes
//! (`rmp_serde::to_vec_named()`), the same format the replication messages
//! travel in. Decoding is strict: an unknown kind code or a kind whose
//! value/expected fields do not line up is reported as a malformed chain
//! rather than guessed at.

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::operation::{Operation, OperationKind};
use crate::types::Key;

/// Errors raised while encoding operations or decoding chains.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// A chain element could not be decoded into a valid operation.
    ///
    /// Fatal for the bucket: the chain cannot be folded deterministically.
    #[error("malformed chain element at position {position}: {reason}")]
    MalformedChain { position: usize, reason: String },
    #[error("failed to encode operation: {0}")]
    Encode(String),
}

/// On-the-wire layout of an encoded operation.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationFrame {
    kind: u8,
    key: Key,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "optional_bytes")]
    value: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "optional_bytes")]
    expected: Option<Vec<u8>>,
    timestamp: Timestamp,
}

mod optional_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(serde_bytes::Bytes::new(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let bytes: Option<serde_bytes::ByteBuf> = Option::deserialize(d)?;
        Ok(bytes.map(serde_bytes::ByteBuf::into_vec))
    }
}

/// Encodes an operation into an element payload.
///
/// # Errors
///
/// Returns [`ChainError::Encode`] if serialization fails.
pub fn encode_operation(op: &Operation) -> Result<Vec<u8>, ChainError> {
    let frame = OperationFrame {
        kind: op.kind().code(),
        key: op.key().clone(),
        value: op.value().map(<[u8]>::to_vec),
        expected: op.expected().map(<[u8]>::to_vec),
        timestamp: op.timestamp(),
    };
    rmp_serde::to_vec_named(&frame).map_err(|e| ChainError::Encode(e.to_string()))
}

/// Decodes an element payload at `position` within its chain.
///
/// # Errors
///
/// Returns [`ChainError::MalformedChain`] if the bytes are not a valid frame,
/// carry an unknown kind code, or have fields inconsistent with the kind.
pub fn decode_operation(payload: &[u8], position: usize) -> Result<Operation, ChainError> {
    let frame: OperationFrame =
        rmp_serde::from_slice(payload).map_err(|e| ChainError::MalformedChain {
            position,
            reason: e.to_string(),
        })?;

    let kind = OperationKind::from_code(frame.kind).ok_or_else(|| ChainError::MalformedChain {
        position,
        reason: format!("unknown operation kind code {}", frame.kind),
    })?;

    Operation::from_parts(kind, frame.key, frame.value, frame.expected, frame.timestamp).ok_or_else(
        || ChainError::MalformedChain {
            position,
            reason: format!("fields do not match operation kind {kind:?}"),
        },
    )
}
