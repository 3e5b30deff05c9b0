use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash::fnv1a_hash;

/// Opaque, ordered cache key.
///
/// Keys are compared bytewise. Several keys may share one bucket hash; the
/// resolver keeps them apart within a chain.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(#[serde(with = "serde_bytes")] Vec<u8>);

impl Key {
    /// Wraps raw key bytes.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Bucket hash under which this key's chain is stored.
    #[must_use]
    pub fn bucket_hash(&self) -> u64 {
        fnv1a_hash(&self.0)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Key {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "Key({s:?})"),
            Err(_) => write!(f, "Key({:02x?})", self.0),
        }
    }
}

/// Resolved state of one key after folding a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// The key currently maps to this value.
    Present(#[serde(with = "serde_bytes")] Vec<u8>),
    /// The key has no value (never written, removed, or only no-op writes).
    Absent,
}

impl Resolution {
    /// Returns the current value, if any.
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Self::Present(v) => Some(v),
            Self::Absent => None,
        }
    }

    /// Returns `true` if the key currently has a value.
    #[must_use]
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_bucket_hash_is_stable() {
        assert_eq!(Key::from("k1").bucket_hash(), Key::from("k1").bucket_hash());
        assert_ne!(Key::from("k1").bucket_hash(), Key::from("k2").bucket_hash());
    }

    #[test]
    fn key_debug_prints_utf8_or_hex() {
        assert_eq!(format!("{:?}", Key::from("abc")), "Key(\"abc\")");
        assert_eq!(format!("{:?}", Key::new(vec![0xff_u8])), "Key([ff])");
    }

    #[test]
    fn resolution_accessors() {
        let present = Resolution::Present(b"v".to_vec());
        assert!(present.is_present());
        assert_eq!(present.value(), Some(&b"v"[..]));
        assert!(!Resolution::Absent.is_present());
        assert_eq!(Resolution::Absent.value(), None);
    }
}
