//! Point-in-time accounting figures for a [`ServerSideStore`](super::ServerSideStore).

use serde::Serialize;

/// Fixed bookkeeping cost charged per stored bucket (key, chain header,
/// table slot metadata).
pub const BUCKET_OVERHEAD_BYTES: u64 = 48;

/// Bytes reserved per table slot, occupied or not.
pub const SLOT_BYTES: u64 = 16;

/// Snapshot of store size counters.
///
/// `vital_bytes` is the bookkeeping that must stay resident for the store to
/// function; `occupied_bytes` is element payload; `allocated_bytes` adds the
/// table's reserved slots on top of both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    /// Number of buckets holding a chain.
    pub size: u64,
    pub table_capacity: u64,
    pub allocated_bytes: u64,
    pub vital_bytes: u64,
    pub occupied_bytes: u64,
    /// Total number of chain elements across all buckets.
    pub data_size: u64,
}

impl StoreStats {
    #[must_use]
    pub fn compute(size: u64, table_capacity: u64, occupied_bytes: u64, data_size: u64) -> Self {
        let vital_bytes = size.saturating_mul(BUCKET_OVERHEAD_BYTES);
        let allocated_bytes = table_capacity
            .saturating_mul(SLOT_BYTES)
            .saturating_add(vital_bytes)
            .saturating_add(occupied_bytes);
        Self {
            size,
            table_capacity,
            allocated_bytes,
            vital_bytes,
            occupied_bytes,
            data_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_store_only_pays_for_slots() {
        let stats = StoreStats::compute(0, 4, 0, 0);
        assert_eq!(stats.vital_bytes, 0);
        assert_eq!(stats.allocated_bytes, 4 * SLOT_BYTES);
    }

    #[test]
    fn allocated_covers_vital_and_occupied() {
        let stats = StoreStats::compute(2, 8, 100, 5);
        assert_eq!(stats.vital_bytes, 2 * BUCKET_OVERHEAD_BYTES);
        assert_eq!(
            stats.allocated_bytes,
            8 * SLOT_BYTES + 2 * BUCKET_OVERHEAD_BYTES + 100
        );
        assert_eq!(stats.data_size, 5);
    }
}
