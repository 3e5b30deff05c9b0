//! Chain storage for the tier.
//!
//! Two layers:
//!
//! - **Engine** ([`ChainStorage`]): concurrent bucket → chain map with
//!   append, head compare-and-swap, and cursor iteration
//! - **Store** ([`ServerSideStore`]): operation encoding, resolution on read,
//!   lazy compaction, and size accounting published to [`StoreObserver`]s

pub mod engine;
pub mod engines;
pub mod observer;
pub mod server_store;
pub mod stats;

pub use engine::{ChainStorage, FetchResult, IterationCursor, ReplaceOutcome};
pub use engines::HashMapChainStorage;
pub use observer::{CompositeStoreObserver, StoreChange, StoreObserver};
pub use server_store::{Compaction, ServerSideStore, StoreError};
pub use stats::StoreStats;
