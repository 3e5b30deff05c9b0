//! The active node: orders, applies, replicates and invalidates client work.
//!
//! Every mutation runs the same pipeline under the ordering gate for its
//! bucket: dedup, stamp, append, replicate, open the invalidation round and
//! notify responders. The gate is released before waiting on the passive's
//! receipt (sync replication) or the responders (strong consistency), so a
//! slow client only holds up its own writers.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tiercache_core::{Key, MonotonicClock, Resolution};
use tracing::{debug, info, warn};

use super::error::TierError;
use super::gate::OrderingGate;
use super::mutation::{MutationAck, MutationRequest};
use crate::clients::{Attachment, ClientId, ClientNotifier, ClientRegistry, Dedup};
use crate::config::{Consistency, TierConfig};
use crate::invalidation::{
    CompletedInvalidation, InvalidationCoordinator, InvalidationId, InvalidationScope,
    InvalidationTicket,
};
use crate::replication::{ActiveReplicator, ConcurrencyKey, PendingReplication, PromotedState};
use crate::service::compaction::CompactionService;
use crate::storage::{IterationCursor, ServerSideStore, StoreStats};

/// Page size used when scanning the store after promotion.
const RESUME_SCAN_PAGE: usize = 256;

/// Invalidations inherited from a promoted passive.
#[derive(Debug, Default)]
struct Backlog {
    buckets: BTreeSet<u64>,
    clear: bool,
}

impl Backlog {
    /// Removes and returns what a retry covering `scope` has to re-issue.
    fn take_for(&mut self, scope: InvalidationScope) -> Backlog {
        let buckets = match scope {
            InvalidationScope::Bucket(bucket) if self.buckets.remove(&bucket) => {
                BTreeSet::from([bucket])
            }
            _ => BTreeSet::new(),
        };
        Backlog {
            buckets,
            clear: std::mem::take(&mut self.clear),
        }
    }
}

fn scope_key(scope: InvalidationScope) -> ConcurrencyKey {
    match scope {
        InvalidationScope::Bucket(bucket) => ConcurrencyKey::Bucket(bucket),
        InvalidationScope::All => ConcurrencyKey::Global,
    }
}

/// Active tier node.
pub struct ActiveTier {
    config: TierConfig,
    store: Arc<ServerSideStore>,
    clients: Arc<ClientRegistry>,
    coordinator: InvalidationCoordinator,
    replicator: ActiveReplicator,
    notifier: Arc<dyn ClientNotifier>,
    gate: OrderingGate,
    clock: MonotonicClock,
    compaction: Option<Arc<CompactionService>>,
    backlog: Mutex<Backlog>,
}

impl ActiveTier {
    #[must_use]
    pub fn new(
        config: TierConfig,
        store: Arc<ServerSideStore>,
        clients: Arc<ClientRegistry>,
        replicator: ActiveReplicator,
        notifier: Arc<dyn ClientNotifier>,
    ) -> Self {
        Self {
            gate: OrderingGate::new(config.ordering_stripes),
            config,
            store,
            clients,
            coordinator: InvalidationCoordinator::new(),
            replicator,
            notifier,
            clock: MonotonicClock::system(),
            compaction: None,
            backlog: Mutex::new(Backlog::default()),
        }
    }

    /// Builds an active from a promoted passive's state.
    ///
    /// The clock is advanced past every timestamp already in the store, and
    /// the passive's outstanding invalidations are kept for
    /// [`resume_pending_invalidations`](Self::resume_pending_invalidations).
    #[must_use]
    pub fn resume(
        config: TierConfig,
        promoted: PromotedState,
        replicator: ActiveReplicator,
        notifier: Arc<dyn ClientNotifier>,
    ) -> Self {
        let PromotedState {
            store,
            clients,
            pending_buckets,
            clear_pending,
        } = promoted;
        let tier = Self::new(config, store, clients, replicator, notifier);
        tier.observe_stored_timestamps();
        info!(
            node = %tier.config.node_id,
            pending_buckets = pending_buckets.len(),
            clear_pending,
            "resuming as active"
        );
        *tier.backlog.lock() = Backlog {
            buckets: pending_buckets.into_iter().collect(),
            clear: clear_pending,
        };
        tier
    }

    /// Replaces the timestamp clock.
    #[must_use]
    pub fn with_clock(mut self, clock: MonotonicClock) -> Self {
        self.clock = clock;
        self
    }

    /// Hands buckets that reach the compaction threshold to `service`.
    #[must_use]
    pub fn with_compaction(mut self, service: Arc<CompactionService>) -> Self {
        self.compaction = Some(service);
        self
    }

    #[must_use]
    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ServerSideStore> {
        &self.store
    }

    #[must_use]
    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Number of invalidation rounds still waiting on responders.
    #[must_use]
    pub fn pending_invalidations(&self) -> usize {
        self.coordinator.pending_count()
    }

    /// Attaches a client and registers it with the passive.
    ///
    /// # Errors
    ///
    /// Returns [`TierError::Replication`] if the passive could not be told.
    pub async fn attach_client(&self, client: ClientId) -> Result<Attachment, TierError> {
        let (attachment, replication) = {
            let _guard = self.gate.enter(ConcurrencyKey::Global).await;
            let attachment = self.clients.attach(client);
            let replication = self.replicator.replicate_client_attach(client).await?;
            (attachment, replication)
        };
        replication.settle().await?;
        Ok(attachment)
    }

    /// Marks an attached client as validated. Returns `false` if it is not
    /// attached.
    pub fn validate_client(&self, client: ClientId) -> bool {
        let validated = self.clients.validate(client);
        if !validated {
            warn!(%client, "validation of unattached client ignored");
        }
        validated
    }

    /// Detaches a client. Every round it still owed is treated as
    /// acknowledged. Returns the number of rounds that completed as a result.
    ///
    /// # Errors
    ///
    /// Returns [`TierError::Replication`] if a completion could not be
    /// replicated.
    pub async fn detach_client(&self, client: ClientId) -> Result<usize, TierError> {
        // Global ordering keeps the detach from slipping between a round's
        // responder snapshot and its registration.
        let completed = {
            let _guard = self.gate.enter(ConcurrencyKey::Global).await;
            self.clients.detach(client);
            self.coordinator.client_disconnected(client)
        };
        let count = completed.len();
        for done in completed {
            self.finish(done).await?;
        }
        Ok(count)
    }

    /// Records a client's acknowledgement of round `id`. Returns `true` if
    /// this completed the round.
    ///
    /// # Errors
    ///
    /// Returns [`TierError::Replication`] if the completion could not be
    /// replicated.
    pub async fn acknowledge_invalidation(
        &self,
        client: ClientId,
        id: InvalidationId,
    ) -> Result<bool, TierError> {
        match self.coordinator.acknowledge(client, id) {
            Some(done) => {
                self.finish(done).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Applies one client mutation.
    ///
    /// A retried message is answered with [`MutationAck::Duplicate`]. Under
    /// strong consistency that answer waits for the bucket's outstanding
    /// invalidations, re-issuing any inherited from a promoted passive.
    ///
    /// # Errors
    ///
    /// - [`TierError::UnknownClient`] if the client is not attached
    /// - [`TierError::Store`] if the operation cannot be encoded
    /// - [`TierError::Replication`] if the passive rejected or never got it
    pub async fn mutate(&self, request: MutationRequest) -> Result<MutationAck, TierError> {
        let client = request.client_id;
        let message_id = request.message_id;
        let oldest_outstanding = request.oldest_outstanding.min(message_id);
        let bucket = request.bucket();

        let applied = {
            let _guard = self.gate.enter(ConcurrencyKey::Bucket(bucket)).await;
            match self.admit(client, message_id, oldest_outstanding)? {
                Dedup::Duplicate => None,
                Dedup::Fresh => {
                    let op = request.into_operation(self.clock.tick());
                    let chain = self.store.append(bucket, &op)?;
                    let chain_len = chain.len();
                    let replication = self
                        .replicator
                        .replicate_append(bucket, chain, client, message_id, oldest_outstanding)
                        .await?;
                    let (ticket, completion) = self
                        .fan_out(InvalidationScope::Bucket(bucket), Some(client))
                        .await?;
                    if chain_len >= self.store.compaction_threshold() {
                        if let Some(compaction) = &self.compaction {
                            compaction.request(bucket);
                        }
                    }
                    Some((replication, completion, ticket))
                }
            }
        };

        match applied {
            Some((replication, completion, ticket)) => {
                self.complete_mutation(replication, completion, ticket)
                    .await
            }
            None => self.settle_duplicate(InvalidationScope::Bucket(bucket)).await,
        }
    }

    /// Clears the whole store on behalf of a client.
    ///
    /// # Errors
    ///
    /// Same as [`mutate`](Self::mutate).
    pub async fn clear(
        &self,
        client: ClientId,
        message_id: u64,
        oldest_outstanding: u64,
    ) -> Result<MutationAck, TierError> {
        let oldest_outstanding = oldest_outstanding.min(message_id);
        let applied = {
            let _guard = self.gate.enter(ConcurrencyKey::Global).await;
            match self.admit(client, message_id, oldest_outstanding)? {
                Dedup::Duplicate => None,
                Dedup::Fresh => {
                    let removed = self.store.clear();
                    let replication = self
                        .replicator
                        .replicate_clear(client, message_id, oldest_outstanding)
                        .await?;
                    let (ticket, completion) = self
                        .fan_out(InvalidationScope::All, Some(client))
                        .await?;
                    info!(%client, buckets = removed, "clear applied");
                    Some((replication, completion, ticket))
                }
            }
        };

        match applied {
            Some((replication, completion, ticket)) => {
                self.complete_mutation(replication, completion, ticket)
                    .await
            }
            None => self.settle_duplicate(InvalidationScope::All).await,
        }
    }

    /// Resolves the current value of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`TierError::Store`] if the bucket's chain is malformed.
    pub fn get(&self, key: &Key) -> Result<Resolution, TierError> {
        Ok(self.store.get_value(key)?)
    }

    /// Re-issues invalidations inherited from the promoted passive to every
    /// attached client. Call once clients have reconnected.
    ///
    /// # Errors
    ///
    /// Returns [`TierError::Replication`] if a completion could not be
    /// replicated.
    pub async fn resume_pending_invalidations(&self) -> Result<Vec<InvalidationTicket>, TierError> {
        let backlog = std::mem::take(&mut *self.backlog.lock());
        let tickets = self.reissue(backlog).await?;
        if !tickets.is_empty() {
            info!(rounds = tickets.len(), "re-issued inherited invalidations");
        }
        Ok(tickets)
    }

    /// Opens fresh rounds for inherited invalidations, with no originator.
    async fn reissue(&self, backlog: Backlog) -> Result<Vec<InvalidationTicket>, TierError> {
        let mut tickets = Vec::with_capacity(backlog.buckets.len() + usize::from(backlog.clear));
        let mut completions = Vec::new();

        for bucket in &backlog.buckets {
            let _guard = self.gate.enter(ConcurrencyKey::Bucket(*bucket)).await;
            let (ticket, completion) = self
                .fan_out(InvalidationScope::Bucket(*bucket), None)
                .await?;
            tickets.push(ticket);
            completions.extend(completion);
        }
        if backlog.clear {
            let _guard = self.gate.enter(ConcurrencyKey::Global).await;
            let (ticket, completion) = self.fan_out(InvalidationScope::All, None).await?;
            tickets.push(ticket);
            completions.extend(completion);
        }
        for completion in completions {
            completion.settle().await?;
        }
        Ok(tickets)
    }

    /// Answers a retried message. Under strong consistency the answer waits
    /// until no invalidation for `scope` or for the whole cache is open, so a
    /// retry is never acknowledged ahead of its original's invalidation. No
    /// gate may be held.
    async fn settle_duplicate(&self, scope: InvalidationScope) -> Result<MutationAck, TierError> {
        if self.config.consistency == Consistency::Strong {
            let inherited = self.backlog.lock().take_for(scope);
            if !inherited.buckets.is_empty() || inherited.clear {
                let reissued = self.reissue(inherited).await?;
                info!(?scope, rounds = reissued.len(), "re-issued inherited invalidations for a retry");
            }
            let mut open = self.coordinator.watch_scope(scope);
            if scope != InvalidationScope::All {
                open.extend(self.coordinator.watch_scope(InvalidationScope::All));
            }
            for ticket in open {
                ticket.wait().await;
            }
        }
        Ok(MutationAck::Duplicate)
    }

    /// Checks attachment and duplicate delivery. Ids below
    /// `oldest_outstanding` are forgotten first and count as seen.
    fn admit(
        &self,
        client: ClientId,
        message_id: u64,
        oldest_outstanding: u64,
    ) -> Result<Dedup, TierError> {
        if !self.clients.is_attached(client) {
            return Err(TierError::UnknownClient { client });
        }
        self.clients.prune_messages(client, oldest_outstanding);
        let dedup = self
            .clients
            .track_message(client, message_id)
            .ok_or(TierError::UnknownClient { client })?;
        if dedup == Dedup::Duplicate {
            debug!(%client, message_id, "duplicate message ignored");
        }
        Ok(dedup)
    }

    /// Opens a round for `scope` and notifies its responders. The gate for
    /// `scope` must be held.
    async fn fan_out(
        &self,
        scope: InvalidationScope,
        originator: Option<ClientId>,
    ) -> Result<(InvalidationTicket, Option<PendingReplication>), TierError> {
        let begun = self
            .coordinator
            .begin(scope, originator, &self.clients.attached_clients());
        let id = begun.ticket.id();
        for responder in &begun.responders {
            match scope {
                InvalidationScope::Bucket(bucket) => {
                    self.notifier.invalidate_hash(*responder, bucket, id);
                }
                InvalidationScope::All => self.notifier.invalidate_all(*responder, id),
            }
        }
        let completion = match begun.completed {
            Some(done) => self.send_completion(done).await?,
            None => None,
        };
        Ok((begun.ticket, completion))
    }

    /// Replicates a completed round. The gate for its scope must be held.
    ///
    /// The passive tracks outstanding invalidations per bucket, so the
    /// completion is held back while another round for the same scope is
    /// still open; that round's completion clears the entry instead.
    async fn send_completion(
        &self,
        completed: CompletedInvalidation,
    ) -> Result<Option<PendingReplication>, TierError> {
        if self.coordinator.is_scope_pending(completed.scope) {
            debug!(id = %completed.id, "completion deferred to a later round");
            return Ok(None);
        }
        let pending = match completed.scope {
            InvalidationScope::Bucket(bucket) => {
                self.replicator
                    .replicate_invalidation_complete(bucket)
                    .await?
            }
            InvalidationScope::All => {
                self.replicator
                    .replicate_clear_invalidation_complete()
                    .await?
            }
        };
        Ok(Some(pending))
    }

    async fn finish(&self, completed: CompletedInvalidation) -> Result<(), TierError> {
        let pending = {
            let _guard = self.gate.enter(scope_key(completed.scope)).await;
            self.send_completion(completed).await?
        };
        if let Some(pending) = pending {
            pending.settle().await?;
        }
        Ok(())
    }

    async fn complete_mutation(
        &self,
        replication: PendingReplication,
        completion: Option<PendingReplication>,
        ticket: InvalidationTicket,
    ) -> Result<MutationAck, TierError> {
        replication.settle().await?;
        if let Some(completion) = completion {
            completion.settle().await?;
        }
        let invalidation = ticket.id();
        if self.config.consistency == Consistency::Strong {
            ticket.wait().await;
        }
        Ok(MutationAck::Applied { invalidation })
    }

    fn observe_stored_timestamps(&self) {
        let mut cursor = IterationCursor::start();
        while !cursor.finished {
            let page = self.store.fetch_chains(&cursor, RESUME_SCAN_PAGE);
            for (bucket, chain) in &page.items {
                match chain.operations() {
                    Ok(ops) => {
                        for op in &ops {
                            self.clock.observe(op.timestamp());
                        }
                    }
                    Err(e) => {
                        warn!(bucket, error = %e, "skipping undecodable chain while seeding clock");
                    }
                }
            }
            cursor = page.next_cursor;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::clients::{ChannelNotifier, ClientInvalidation};
    use crate::config::ReplicationMode;
    use crate::replication::{InProcessTransport, PassiveReplica, ReplicationFailure};
    use crate::storage::{CompositeStoreObserver, HashMapChainStorage};
    use crate::tier::mutation::MutationKind;

    struct Harness {
        tier: Arc<ActiveTier>,
        passive: Arc<PassiveReplica>,
        invalidations: UnboundedReceiver<ClientInvalidation>,
        _failures: UnboundedReceiver<ReplicationFailure>,
    }

    fn harness(consistency: Consistency) -> Harness {
        let config = TierConfig {
            consistency,
            compaction_threshold: 4,
            ..TierConfig::default()
        };
        let passive = Arc::new(PassiveReplica::new(config.compaction_threshold, Arc::default()));
        let transport = Arc::new(InProcessTransport::start(Arc::clone(&passive), 64));
        let (replicator, failures) = ActiveReplicator::new(transport, ReplicationMode::Sync);
        let (notifier, invalidations) = ChannelNotifier::new();
        let store = Arc::new(ServerSideStore::new(
            Arc::new(HashMapChainStorage::new()),
            config.compaction_threshold,
            Arc::new(CompositeStoreObserver::default()),
        ));
        let tier = ActiveTier::new(
            config,
            store,
            Arc::new(ClientRegistry::default()),
            replicator,
            Arc::new(notifier),
        );
        Harness {
            tier: Arc::new(tier),
            passive,
            invalidations,
            _failures: failures,
        }
    }

    fn put(client: ClientId, message_id: u64, key: &str, value: &str) -> MutationRequest {
        MutationRequest::put(client, message_id, Key::from(key), value.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn mutation_from_unattached_client_is_rejected() {
        let h = harness(Consistency::Strong);
        let client = ClientId::random();

        let err = h.tier.mutate(put(client, 1, "k", "v")).await.unwrap_err();

        assert_eq!(err, TierError::UnknownClient { client });
        assert!(h.tier.store().is_empty());
    }

    #[tokio::test]
    async fn lone_writer_completes_without_responders() {
        let h = harness(Consistency::Strong);
        let client = ClientId::random();
        h.tier.attach_client(client).await.unwrap();

        let ack = h.tier.mutate(put(client, 1, "k", "v")).await.unwrap();

        assert!(matches!(ack, MutationAck::Applied { .. }));
        assert_eq!(
            h.tier.get(&Key::from("k")).unwrap(),
            Resolution::Present(b"v".to_vec())
        );
        // Sync replication: the passive already has it.
        assert_eq!(
            h.passive.store().get_value(&Key::from("k")).unwrap(),
            Resolution::Present(b"v".to_vec())
        );
        assert!(h.passive.pending_invalidations().is_empty());
    }

    #[tokio::test]
    async fn duplicate_message_is_not_reapplied() {
        let h = harness(Consistency::Eventual);
        let client = ClientId::random();
        h.tier.attach_client(client).await.unwrap();

        h.tier.mutate(put(client, 1, "k", "a")).await.unwrap();
        let retry = h.tier.mutate(put(client, 1, "k", "b")).await.unwrap();

        assert_eq!(retry, MutationAck::Duplicate);
        assert_eq!(h.tier.store().get(Key::from("k").bucket_hash()).len(), 1);
    }

    #[tokio::test]
    async fn strong_retry_waits_for_the_original_round() {
        let mut h = harness(Consistency::Strong);
        let writer = ClientId::random();
        let reader = ClientId::random();
        h.tier.attach_client(writer).await.unwrap();
        h.tier.attach_client(reader).await.unwrap();

        let tier = Arc::clone(&h.tier);
        let original = tokio::spawn(async move { tier.mutate(put(writer, 1, "k", "v")).await });
        let request = h.invalidations.recv().await.unwrap();

        let tier = Arc::clone(&h.tier);
        let retry = tokio::spawn(async move { tier.mutate(put(writer, 1, "k", "v")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!retry.is_finished());

        h.tier
            .acknowledge_invalidation(reader, request.id())
            .await
            .unwrap();

        let retry = tokio::time::timeout(Duration::from_secs(1), retry)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(retry, MutationAck::Duplicate);
        tokio::time::timeout(Duration::from_secs(1), original)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(h.tier.store().get(Key::from("k").bucket_hash()).len(), 1);
    }

    #[tokio::test]
    async fn ids_below_oldest_outstanding_are_duplicates() {
        let h = harness(Consistency::Eventual);
        let client = ClientId::random();
        h.tier.attach_client(client).await.unwrap();

        let ack = h
            .tier
            .mutate(put(client, 5, "k", "a").with_oldest_outstanding(5))
            .await
            .unwrap();
        assert!(matches!(ack, MutationAck::Applied { .. }));
        let late = h.tier.mutate(put(client, 3, "k", "b")).await.unwrap();

        assert_eq!(late, MutationAck::Duplicate);
        assert_eq!(
            h.tier.get(&Key::from("k")).unwrap(),
            Resolution::Present(b"a".to_vec())
        );
        assert_eq!(h.tier.clients().sparse_message_ids(client), 0);
        // The watermark travels with the chain.
        assert_eq!(h.passive.clients().sparse_message_ids(client), 0);
        assert_eq!(h.passive.clients().last_message_id(client), Some(5));
    }

    #[tokio::test]
    async fn validation_requires_an_attached_client() {
        let h = harness(Consistency::Eventual);
        let client = ClientId::random();

        assert!(!h.tier.validate_client(client));
        h.tier.attach_client(client).await.unwrap();
        assert!(h.tier.validate_client(client));
        assert!(h.tier.clients().is_validated(client));

        h.tier.detach_client(client).await.unwrap();
        assert!(!h.tier.clients().is_validated(client));
    }

    #[tokio::test]
    async fn strong_mutation_waits_for_other_clients() {
        let mut h = harness(Consistency::Strong);
        let writer = ClientId::random();
        let reader = ClientId::random();
        h.tier.attach_client(writer).await.unwrap();
        h.tier.attach_client(reader).await.unwrap();

        let tier = Arc::clone(&h.tier);
        let mutation = tokio::spawn(async move { tier.mutate(put(writer, 1, "k", "v")).await });

        let request = h.invalidations.recv().await.unwrap();
        assert_eq!(request.client(), reader);
        assert!(matches!(request, ClientInvalidation::Hash { bucket, .. } if bucket == Key::from("k").bucket_hash()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!mutation.is_finished());
        assert_eq!(h.passive.pending_invalidations(), vec![Key::from("k").bucket_hash()]);

        assert!(h
            .tier
            .acknowledge_invalidation(reader, request.id())
            .await
            .unwrap());

        let ack = tokio::time::timeout(Duration::from_secs(1), mutation)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            ack,
            MutationAck::Applied {
                invalidation: request.id()
            }
        );
        assert!(h.passive.pending_invalidations().is_empty());
    }

    #[tokio::test]
    async fn disconnect_releases_strong_mutation() {
        let mut h = harness(Consistency::Strong);
        let writer = ClientId::random();
        let reader = ClientId::random();
        h.tier.attach_client(writer).await.unwrap();
        h.tier.attach_client(reader).await.unwrap();

        let tier = Arc::clone(&h.tier);
        let mutation = tokio::spawn(async move { tier.mutate(put(writer, 1, "k", "v")).await });
        h.invalidations.recv().await.unwrap();

        assert_eq!(h.tier.detach_client(reader).await.unwrap(), 1);

        tokio::time::timeout(Duration::from_secs(1), mutation)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(h.tier.pending_invalidations(), 0);
    }

    #[tokio::test]
    async fn eventual_mutation_does_not_wait() {
        let mut h = harness(Consistency::Eventual);
        let writer = ClientId::random();
        let reader = ClientId::random();
        h.tier.attach_client(writer).await.unwrap();
        h.tier.attach_client(reader).await.unwrap();

        h.tier.mutate(put(writer, 1, "k", "v")).await.unwrap();

        assert_eq!(h.invalidations.recv().await.unwrap().client(), reader);
        assert_eq!(h.tier.pending_invalidations(), 1);
    }

    #[tokio::test]
    async fn clear_invalidates_everyone_else() {
        let mut h = harness(Consistency::Eventual);
        let writer = ClientId::random();
        let reader = ClientId::random();
        h.tier.attach_client(writer).await.unwrap();
        h.tier.attach_client(reader).await.unwrap();
        h.tier.mutate(put(writer, 1, "a", "1")).await.unwrap();
        let _ = h.invalidations.recv().await.unwrap();

        h.tier.clear(writer, 2, 2).await.unwrap();

        let request = h.invalidations.recv().await.unwrap();
        assert!(matches!(request, ClientInvalidation::All { client, .. } if client == reader));
        assert!(h.tier.store().is_empty());
        assert!(h.passive.store().is_empty());
        assert!(h.passive.clear_pending());

        h.tier
            .acknowledge_invalidation(reader, request.id())
            .await
            .unwrap();
        assert!(!h.passive.clear_pending());
    }

    #[tokio::test]
    async fn conditional_mutations_resolve_against_chain() {
        let h = harness(Consistency::Eventual);
        let client = ClientId::random();
        h.tier.attach_client(client).await.unwrap();
        let key = Key::from("k");

        h.tier.mutate(put(client, 1, "k", "a")).await.unwrap();
        h.tier
            .mutate(MutationRequest::new(
                client,
                2,
                key.clone(),
                MutationKind::ConditionalReplace {
                    expected: b"zzz".to_vec(),
                    value: b"b".to_vec(),
                },
            ))
            .await
            .unwrap();
        assert_eq!(h.tier.get(&key).unwrap(), Resolution::Present(b"a".to_vec()));

        h.tier
            .mutate(MutationRequest::new(
                client,
                3,
                key.clone(),
                MutationKind::ConditionalRemove {
                    expected: b"a".to_vec(),
                },
            ))
            .await
            .unwrap();
        assert_eq!(h.tier.get(&key).unwrap(), Resolution::Absent);
    }

    struct FrozenClock(u64);

    impl tiercache_core::ClockSource for FrozenClock {
        fn now(&self) -> u64 {
            self.0
        }
    }

    #[tokio::test]
    async fn appended_operations_carry_increasing_timestamps() {
        let h = harness(Consistency::Eventual);
        let tier = Arc::try_unwrap(h.tier)
            .ok()
            .unwrap()
            .with_clock(MonotonicClock::with_source(Box::new(FrozenClock(1_000))));
        let client = ClientId::random();
        tier.attach_client(client).await.unwrap();

        tier.mutate(put(client, 1, "k", "a")).await.unwrap();
        tier.mutate(put(client, 2, "k", "b")).await.unwrap();

        let ops = tier
            .store()
            .get(Key::from("k").bucket_hash())
            .operations()
            .unwrap();
        let stamps: Vec<_> = ops.iter().map(|op| op.timestamp()).collect();
        assert_eq!(stamps[0].millis, 1_000);
        assert!(stamps[0] < stamps[1]);
    }

    #[tokio::test]
    async fn resume_reissues_inherited_invalidations() {
        let mut h = harness(Consistency::Eventual);
        let writer = ClientId::random();
        let reader = ClientId::random();
        h.tier.attach_client(writer).await.unwrap();
        h.tier.attach_client(reader).await.unwrap();
        h.tier.mutate(put(writer, 1, "k", "v")).await.unwrap();
        let _ = h.invalidations.recv().await.unwrap();

        let promoted = h.passive.promote();
        let (notifier, mut invalidations) = ChannelNotifier::new();
        let next_passive = Arc::new(PassiveReplica::new(4, Arc::default()));
        let transport = Arc::new(InProcessTransport::start(next_passive, 16));
        let (replicator, _failures) = ActiveReplicator::new(transport, ReplicationMode::Sync);
        let resumed = ActiveTier::resume(
            TierConfig::default(),
            promoted,
            replicator,
            Arc::new(notifier),
        );

        assert_eq!(
            resumed.get(&Key::from("k")).unwrap(),
            Resolution::Present(b"v".to_vec())
        );
        assert_eq!(resumed.attach_client(reader).await.unwrap(), Attachment::Reattached);

        let tickets = resumed.resume_pending_invalidations().await.unwrap();

        assert_eq!(tickets.len(), 1);
        let request = invalidations.recv().await.unwrap();
        assert_eq!(request.client(), reader);
        // Backlog is drained exactly once.
        assert!(resumed.resume_pending_invalidations().await.unwrap().is_empty());
    }
}
