//! Client identities, lifecycle events, and invalidation delivery.

pub mod events;
pub mod notifier;
pub mod registry;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use events::{ClientEvent, ClientEventListener, CompositeClientListener};
pub use notifier::{ChannelNotifier, ClientInvalidation, ClientNotifier};
pub use registry::{Attachment, ClientRegistry, Dedup};

/// Stable identity of a client process attached to the tier.
///
/// The identity survives reconnects and failover; it is the key for
/// duplicate detection and for the invalidation responder set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generates a fresh random identity.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
