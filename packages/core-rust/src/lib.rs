//! `tiercache` core: operations, chains, and chain resolution.

pub mod chain;
pub mod clock;
pub mod codec;
pub mod hash;
pub mod operation;
pub mod resolver;
pub mod types;

pub use chain::{Chain, Element};
pub use clock::{ClockSource, MonotonicClock, SystemClock, Timestamp};
pub use codec::ChainError;
pub use operation::{Operation, OperationKind};
pub use resolver::{resolve, ChainResolver, ResolvedChain};
pub use types::{Key, Resolution};
