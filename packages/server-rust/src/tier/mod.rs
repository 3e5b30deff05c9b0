//! Active tier orchestration.

pub mod active;
pub mod error;
pub mod gate;
pub mod mutation;

pub use active::ActiveTier;
pub use error::TierError;
pub use gate::{GateGuard, OrderingGate};
pub use mutation::{MutationAck, MutationKind, MutationRequest};
