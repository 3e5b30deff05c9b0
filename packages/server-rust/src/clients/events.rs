//! Client lifecycle events and listener fan-out.
//!
//! The registry publishes plain [`ClientEvent`]s instead of calling into any
//! management or monitoring layer. Adapters that expose client state
//! elsewhere implement [`ClientEventListener`] and are registered on the
//! [`CompositeClientListener`].

use std::sync::Arc;

use super::ClientId;

/// A change in a client's attachment to the tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// A client connected and attached for the first time.
    Connected(ClientId),
    /// A connected client completed validation against the tier.
    Validated(ClientId),
    /// A previously known client attached again (e.g. after failover).
    Reconnected(ClientId),
    /// A client's connection went away.
    Disconnected(ClientId),
}

impl ClientEvent {
    #[must_use]
    pub fn client_id(&self) -> ClientId {
        match self {
            Self::Connected(id)
            | Self::Validated(id)
            | Self::Reconnected(id)
            | Self::Disconnected(id) => *id,
        }
    }
}

/// Observer for client lifecycle events.
///
/// Used as `Arc<dyn ClientEventListener>`.
pub trait ClientEventListener: Send + Sync {
    fn on_client_event(&self, event: &ClientEvent);
}

/// Listener that fans out to multiple listeners.
#[derive(Default)]
pub struct CompositeClientListener {
    listeners: Vec<Arc<dyn ClientEventListener>>,
}

impl CompositeClientListener {
    #[must_use]
    pub fn new(listeners: Vec<Arc<dyn ClientEventListener>>) -> Self {
        Self { listeners }
    }

    /// Adds a listener after construction.
    pub fn add(&mut self, listener: Arc<dyn ClientEventListener>) {
        self.listeners.push(listener);
    }
}

impl ClientEventListener for CompositeClientListener {
    fn on_client_event(&self, event: &ClientEvent) {
        for listener in &self.listeners {
            listener.on_client_event(event);
        }
    }
}
