//! FNV-1a hashing for bucket routing.
//!
//! Every cache key maps to a 64-bit bucket hash. The bucket hash is the unit
//! of storage (one chain per bucket) and the concurrency key for replication
//! ordering, so it must be stable across nodes and process restarts. FNV-1a
//! is used because it is deterministic, seed-free, and cheap for short keys.

/// FNV-1a offset basis (64-bit).
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a prime (64-bit).
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Computes a 64-bit FNV-1a hash over raw key bytes.
///
/// # Examples
///
/// ```
/// use tiercache_core::hash::fnv1a_hash;
///
/// assert_eq!(fnv1a_hash(b""), 0xcbf2_9ce4_8422_2325); // offset basis
/// assert_eq!(fnv1a_hash(b"a"), 0xaf63_dc4c_8601_ec8c);
/// ```
#[must_use]
pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Maps a bucket hash onto one of `stripes` ordering lanes.
///
/// Returns 0 when `stripes` is 0 so callers never divide by zero.
#[must_use]
pub fn stripe_for(bucket: u64, stripes: usize) -> usize {
    if stripes == 0 {
        return 0;
    }
    // Stripe counts are small configuration values; the modulo result fits.
    #[allow(clippy::cast_possible_truncation)]
    let stripe = (bucket % stripes as u64) as usize;
    stripe
}
