//! Registry of client identities known to this node.
//!
//! On the active node the registry answers "who is attached right now" (the
//! invalidation fan-out set) and "has this client already sent this message"
//! (retry detection). On the passive node the same structure only tracks
//! identities and message watermarks, so that after promotion reconnecting
//! clients are recognized without re-registration.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use super::events::{ClientEvent, ClientEventListener, CompositeClientListener};
use super::ClientId;

/// Outcome of [`ClientRegistry::attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    /// First time this identity was seen.
    New,
    /// The identity was known (tracked or previously attached) and is attached again.
    Reattached,
    /// The client was already attached; nothing changed.
    AlreadyAttached,
}

/// Outcome of [`ClientRegistry::track_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dedup {
    /// First time this message id was seen; it is now recorded.
    Fresh,
    /// The message id was already seen (client retry or replayed message).
    Duplicate,
}

/// Message ids seen from one client.
///
/// Every id at or below `low` has been seen; `above` holds the seen ids past
/// the first gap. Ids may arrive out of order because messages for different
/// buckets pass the ordering gate independently.
#[derive(Debug, Default)]
struct SeenIds {
    low: u64,
    above: BTreeSet<u64>,
}

impl SeenIds {
    fn record(&mut self, id: u64) -> Dedup {
        if id <= self.low || !self.above.insert(id) {
            return Dedup::Duplicate;
        }
        self.advance();
        Dedup::Fresh
    }

    /// Marks every id below `oldest_outstanding` as seen.
    fn prune_below(&mut self, oldest_outstanding: u64) {
        let floor = oldest_outstanding.saturating_sub(1);
        if floor > self.low {
            self.low = floor;
            self.above = self.above.split_off(&(floor + 1));
            self.advance();
        }
    }

    fn advance(&mut self) {
        while self.above.remove(&(self.low + 1)) {
            self.low += 1;
        }
    }

    fn highest(&self) -> Option<u64> {
        self.above
            .last()
            .copied()
            .or((self.low > 0).then_some(self.low))
    }
}

#[derive(Debug, Default)]
struct ClientState {
    attached: bool,
    validated: bool,
    seen: SeenIds,
}

impl ClientState {
    fn tracked() -> Self {
        Self::default()
    }
}

/// Thread-safe client identity registry.
pub struct ClientRegistry {
    clients: DashMap<ClientId, ClientState>,
    listener: Arc<CompositeClientListener>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(Arc::new(CompositeClientListener::default()))
    }
}

impl ClientRegistry {
    #[must_use]
    pub fn new(listener: Arc<CompositeClientListener>) -> Self {
        Self {
            clients: DashMap::new(),
            listener,
        }
    }

    /// Registers an identity without attaching it. Idempotent.
    ///
    /// Returns `true` if the identity was not known before.
    pub fn track(&self, client: ClientId) -> bool {
        let mut inserted = false;
        self.clients.entry(client).or_insert_with(|| {
            inserted = true;
            ClientState::tracked()
        });
        if inserted {
            debug!(%client, "client identity tracked");
        }
        inserted
    }

    /// Marks a client as attached, emitting `Connected` or `Reconnected`.
    pub fn attach(&self, client: ClientId) -> Attachment {
        let attachment = match self.clients.entry(client) {
            Entry::Occupied(mut occupied) => {
                let state = occupied.get_mut();
                if state.attached {
                    Attachment::AlreadyAttached
                } else {
                    state.attached = true;
                    Attachment::Reattached
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ClientState {
                    attached: true,
                    ..ClientState::tracked()
                });
                Attachment::New
            }
        };

        match attachment {
            Attachment::New => {
                info!(%client, "client connected");
                self.listener.on_client_event(&ClientEvent::Connected(client));
            }
            Attachment::Reattached => {
                info!(%client, "client reconnected");
                self.listener.on_client_event(&ClientEvent::Reconnected(client));
            }
            Attachment::AlreadyAttached => {}
        }
        attachment
    }

    /// Marks an attached client as validated. Returns `false` if not attached.
    pub fn validate(&self, client: ClientId) -> bool {
        let validated = match self.clients.get_mut(&client) {
            Some(mut state) if state.attached => {
                state.validated = true;
                true
            }
            _ => false,
        };
        if validated {
            self.listener.on_client_event(&ClientEvent::Validated(client));
        }
        validated
    }

    /// Marks a client as detached. Dedup state is kept so a reconnect after
    /// failover still recognizes retried messages.
    ///
    /// Returns `true` if the client was attached.
    pub fn detach(&self, client: ClientId) -> bool {
        let was_attached = match self.clients.get_mut(&client) {
            Some(mut state) if state.attached => {
                state.attached = false;
                state.validated = false;
                true
            }
            _ => false,
        };
        if was_attached {
            info!(%client, "client disconnected");
            self.listener.on_client_event(&ClientEvent::Disconnected(client));
        }
        was_attached
    }

    #[must_use]
    pub fn is_tracked(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }

    #[must_use]
    pub fn is_attached(&self, client: ClientId) -> bool {
        self.clients.get(&client).is_some_and(|s| s.attached)
    }

    #[must_use]
    pub fn is_validated(&self, client: ClientId) -> bool {
        self.clients.get(&client).is_some_and(|s| s.validated)
    }

    /// Snapshot of all currently attached clients.
    #[must_use]
    pub fn attached_clients(&self) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|entry| entry.value().attached)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Records `message_id` for `client`, reporting whether it was seen before.
    ///
    /// Message ids start at 1. Returns `None` if the client is not tracked.
    pub fn track_message(&self, client: ClientId, message_id: u64) -> Option<Dedup> {
        let mut state = self.clients.get_mut(&client)?;
        Some(state.seen.record(message_id))
    }

    /// Forgets individual ids below `oldest_outstanding`, treating all of
    /// them as seen. Clients report the oldest id they still await an answer
    /// for, which bounds the tracking set when ids are skipped.
    pub fn prune_messages(&self, client: ClientId, oldest_outstanding: u64) {
        if let Some(mut state) = self.clients.get_mut(&client) {
            state.seen.prune_below(oldest_outstanding);
        }
    }

    /// Number of ids held individually past the contiguous watermark.
    #[cfg(test)]
    pub(crate) fn sparse_message_ids(&self, client: ClientId) -> usize {
        self.clients.get(&client).map_or(0, |s| s.seen.above.len())
    }

    /// Highest message id recorded for a client.
    #[must_use]
    pub fn last_message_id(&self, client: ClientId) -> Option<u64> {
        self.clients.get(&client).and_then(|s| s.seen.highest())
    }

    /// Number of tracked identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Marks every client detached without emitting events.
    ///
    /// Used when a promoted passive takes over: every client must reconnect
    /// to the new active, but their identities and watermarks carry over.
    pub fn reset_attachments(&self) {
        for mut entry in self.clients.iter_mut() {
            entry.attached = false;
            entry.validated = false;
        }
    }
}
