//! Background services.
//!
//! - `worker`: generic bounded-queue worker with a periodic tick
//! - `compaction`: chain compaction on top of `worker`

pub mod compaction;
pub mod worker;

pub use compaction::{CompactionRunnable, CompactionService, CompactionTask};
pub use worker::{BackgroundRunnable, BackgroundWorker};
