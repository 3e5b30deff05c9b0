//! Tracks in-flight client invalidations and decides when each completes.
//!
//! Every mutation opens one pending record holding the set of clients that
//! still owe an acknowledgement. Acks and disconnects shrink the set; the
//! removal that empties it completes the record. Completion happens exactly
//! once: the record is removed from the table in the same critical section
//! that observes the empty set.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::clients::ClientId;

/// Identifier of one invalidation round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InvalidationId(u64);

impl InvalidationId {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InvalidationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inv-{}", self.0)
    }
}

/// What an invalidation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationScope {
    /// Entries whose key hashes to this bucket.
    Bucket(u64),
    /// The whole cache (clear).
    All,
}

/// A finished invalidation round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedInvalidation {
    pub id: InvalidationId,
    pub scope: InvalidationScope,
}

/// Waiter half handed to the mutation that opened the round.
#[derive(Debug)]
pub struct InvalidationTicket {
    id: InvalidationId,
    rx: oneshot::Receiver<()>,
}

impl InvalidationTicket {
    #[must_use]
    pub fn id(&self) -> InvalidationId {
        self.id
    }

    /// Resolves once every responder has acknowledged or disconnected.
    pub async fn wait(self) {
        // A dropped sender means the coordinator itself went away; nobody is
        // left to wait for.
        let _ = self.rx.await;
    }
}

/// Result of [`InvalidationCoordinator::begin`].
#[derive(Debug)]
pub struct BegunInvalidation {
    pub ticket: InvalidationTicket,
    /// Clients that must be asked to invalidate.
    pub responders: Vec<ClientId>,
    /// Set when there were no responders and the round completed on the spot.
    pub completed: Option<CompletedInvalidation>,
}

struct Pending {
    scope: InvalidationScope,
    awaiting: HashSet<ClientId>,
    waiters: Vec<oneshot::Sender<()>>,
}

impl Pending {
    fn complete(self, id: InvalidationId) -> CompletedInvalidation {
        for waiter in self.waiters {
            let _ = waiter.send(());
        }
        CompletedInvalidation {
            id,
            scope: self.scope,
        }
    }
}

/// Table of pending invalidation rounds.
#[derive(Default)]
pub struct InvalidationCoordinator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<InvalidationId, Pending>>,
}

impl InvalidationCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a round for `scope`.
    ///
    /// Responders are `attached` minus `originator`: the writing client
    /// already knows about its own change.
    pub fn begin(
        &self,
        scope: InvalidationScope,
        originator: Option<ClientId>,
        attached: &[ClientId],
    ) -> BegunInvalidation {
        let id = InvalidationId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = oneshot::channel();
        let awaiting: HashSet<ClientId> = attached
            .iter()
            .copied()
            .filter(|client| Some(*client) != originator)
            .collect();
        let responders: Vec<ClientId> = awaiting.iter().copied().collect();
        let pending = Pending {
            scope,
            awaiting,
            waiters: vec![tx],
        };

        let completed = if responders.is_empty() {
            Some(pending.complete(id))
        } else {
            self.pending.lock().insert(id, pending);
            None
        };
        debug!(%id, ?scope, responders = responders.len(), "invalidation started");

        BegunInvalidation {
            ticket: InvalidationTicket { id, rx },
            responders,
            completed,
        }
    }

    /// Records `client`'s acknowledgement of round `id`.
    ///
    /// Returns the completed round if this was the last outstanding
    /// responder. Acks for unknown rounds or from clients not awaited are
    /// ignored.
    pub fn acknowledge(&self, client: ClientId, id: InvalidationId) -> Option<CompletedInvalidation> {
        let mut pending = self.pending.lock();
        let Some(record) = pending.get_mut(&id) else {
            warn!(%client, %id, "ack for unknown or finished invalidation ignored");
            return None;
        };
        if !record.awaiting.remove(&client) {
            warn!(%client, %id, "ack from client not awaited ignored");
            return None;
        }
        if !record.awaiting.is_empty() {
            return None;
        }
        let record = pending.remove(&id)?;
        drop(pending);
        let completed = record.complete(id);
        debug!(%id, "invalidation complete");
        Some(completed)
    }

    /// Treats `client`'s disconnect as an acknowledgement of every round it
    /// still owes. Returns the rounds this completed.
    pub fn client_disconnected(&self, client: ClientId) -> Vec<CompletedInvalidation> {
        let mut pending = self.pending.lock();
        let finished: Vec<InvalidationId> = pending
            .iter_mut()
            .filter_map(|(id, record)| {
                (record.awaiting.remove(&client) && record.awaiting.is_empty()).then_some(*id)
            })
            .collect();
        let records: Vec<(InvalidationId, Pending)> = finished
            .into_iter()
            .filter_map(|id| pending.remove(&id).map(|record| (id, record)))
            .collect();
        drop(pending);

        let mut completed: Vec<CompletedInvalidation> = records
            .into_iter()
            .map(|(id, record)| record.complete(id))
            .collect();
        completed.sort_by_key(|c| c.id);
        if !completed.is_empty() {
            debug!(%client, count = completed.len(), "disconnect completed invalidations");
        }
        completed
    }

    /// Number of rounds still waiting on responders.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    #[must_use]
    pub fn is_pending(&self, id: InvalidationId) -> bool {
        self.pending.lock().contains_key(&id)
    }

    /// Whether any round for `scope` is still waiting on responders.
    #[must_use]
    pub fn is_scope_pending(&self, scope: InvalidationScope) -> bool {
        self.pending.lock().values().any(|record| record.scope == scope)
    }

    /// Tickets for every round of `scope` still open, resolving as each
    /// completes. Empty when nothing is outstanding.
    pub fn watch_scope(&self, scope: InvalidationScope) -> Vec<InvalidationTicket> {
        let mut pending = self.pending.lock();
        let mut tickets: Vec<InvalidationTicket> = pending
            .iter_mut()
            .filter(|(_, record)| record.scope == scope)
            .map(|(id, record)| {
                let (tx, rx) = oneshot::channel();
                record.waiters.push(tx);
                InvalidationTicket { id: *id, rx }
            })
            .collect();
        tickets.sort_by_key(InvalidationTicket::id);
        tickets
    }
}
