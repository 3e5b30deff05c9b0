//! Monotonic append timestamps.
//!
//! Every operation appended to a chain is stamped with a [`Timestamp`] taken
//! from a [`MonotonicClock`]. The clock combines physical wall-clock time
//! with a logical counter, so timestamps never go backwards even when the
//! system clock does, and operations appended within the same millisecond
//! remain totally ordered.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Number of low bits of the packed clock state reserved for the counter.
const COUNTER_BITS: u32 = 16;

/// Largest counter value before the clock borrows from the next millisecond.
const COUNTER_MAX: u64 = (1 << COUNTER_BITS) - 1;

/// A hybrid timestamp: wall-clock milliseconds plus a logical counter.
///
/// Ordering is millis first, then counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp {
    /// Physical wall-clock milliseconds since Unix epoch.
    pub millis: u64,
    /// Logical counter for events within the same millisecond.
    pub counter: u32,
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis
            .cmp(&other.millis)
            .then_with(|| self.counter.cmp(&other.counter))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Timestamp {
    fn pack(self) -> u64 {
        (self.millis << COUNTER_BITS) | (u64::from(self.counter) & COUNTER_MAX)
    }

    fn unpack(packed: u64) -> Self {
        // The counter occupies COUNTER_BITS bits, so it always fits in u32.
        #[allow(clippy::cast_possible_truncation)]
        let counter = (packed & COUNTER_MAX) as u32;
        Self {
            millis: packed >> COUNTER_BITS,
            counter,
        }
    }
}

/// Abstraction over the system clock for dependency injection.
///
/// Allows deterministic testing by replacing the real clock with a virtual one.
pub trait ClockSource: Send + Sync {
    /// Returns the current time as milliseconds since Unix epoch.
    fn now(&self) -> u64;
}

/// Default clock source that reads the real system time.
#[derive(Debug, Clone)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> u64 {
        // Milliseconds since 1970 fit in u64 for the foreseeable future.
        #[allow(clippy::cast_possible_truncation)]
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        millis
    }
}

/// Lock-free monotonic timestamp generator.
///
/// The last issued timestamp is packed into a single `AtomicU64`
/// (48 bits of millis, 16 bits of counter) and advanced with a CAS loop, so
/// concurrent appenders on different buckets never contend on a lock.
pub struct MonotonicClock {
    last: AtomicU64,
    source: Box<dyn ClockSource>,
}

impl MonotonicClock {
    /// Creates a clock backed by the system time.
    #[must_use]
    pub fn system() -> Self {
        Self::with_source(Box::new(SystemClock))
    }

    /// Creates a clock backed by the given source.
    #[must_use]
    pub fn with_source(source: Box<dyn ClockSource>) -> Self {
        Self {
            last: AtomicU64::new(0),
            source,
        }
    }

    /// Issues the next timestamp, strictly greater than every previous one.
    pub fn tick(&self) -> Timestamp {
        let physical = self.source.now() << COUNTER_BITS;
        let mut next = 0;
        // fetch_update only fails when the closure returns None, which it never does.
        let _ = self
            .last
            .fetch_update(AtomicOrdering::AcqRel, AtomicOrdering::Acquire, |last| {
                next = if physical > last { physical } else { last + 1 };
                Some(next)
            });
        Timestamp::unpack(next)
    }

    /// Advances the clock so later ticks are greater than `observed`.
    ///
    /// Called when a node takes over state stamped by another node's clock.
    pub fn observe(&self, observed: Timestamp) {
        self.last.fetch_max(observed.pack(), AtomicOrdering::AcqRel);
    }
}

impl std::fmt::Debug for MonotonicClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonotonicClock")
            .field("last", &Timestamp::unpack(self.last.load(AtomicOrdering::Relaxed)))
            .finish_non_exhaustive()
    }
}
