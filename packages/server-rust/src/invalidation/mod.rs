//! Cache-coherence invalidation across attached clients.

pub mod coordinator;

pub use coordinator::{
    BegunInvalidation, CompletedInvalidation, InvalidationCoordinator, InvalidationId,
    InvalidationScope, InvalidationTicket,
};
