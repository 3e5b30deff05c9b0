//! Passive side of the replication channel.
//!
//! The passive mirrors the active's store by installing every shipped chain
//! wholesale, so applying a duplicate is harmless. Alongside the store it
//! keeps shadow bookkeeping of invalidations the active has started but not
//! yet finished; after promotion those are re-issued to reconnected clients.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::error::{ProtocolMisuse, ReplicationError};
use super::messages::ReplicationMessage;
use crate::clients::{ClientId, ClientRegistry};
use crate::storage::{CompositeStoreObserver, HashMapChainStorage, ServerSideStore};

/// What the passive knows about one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
    /// No chain has been replicated for this bucket since start or the last clear.
    Unknown,
    /// A chain has been installed.
    Present,
}

/// Everything a promoted passive hands to the new active.
pub struct PromotedState {
    pub store: Arc<ServerSideStore>,
    pub clients: Arc<ClientRegistry>,
    /// Buckets whose invalidation was started but never completed.
    pub pending_buckets: Vec<u64>,
    /// A clear-all invalidation was started but never completed.
    pub clear_pending: bool,
}

/// Replica state on the passive node.
pub struct PassiveReplica {
    store: Arc<ServerSideStore>,
    clients: Arc<ClientRegistry>,
    known_buckets: DashSet<u64>,
    pending_invalidations: Mutex<BTreeSet<u64>>,
    clear_pending: AtomicBool,
}

impl PassiveReplica {
    /// Creates a replica with an in-memory store reporting to `observer`.
    ///
    /// The store outlives promotion, so `observer` keeps seeing changes once
    /// this replica serves as the active.
    #[must_use]
    pub fn new(compaction_threshold: usize, observer: Arc<CompositeStoreObserver>) -> Self {
        let store = ServerSideStore::new(
            Arc::new(HashMapChainStorage::new()),
            compaction_threshold,
            observer,
        );
        Self::with_parts(Arc::new(store), Arc::new(ClientRegistry::default()))
    }

    #[must_use]
    pub fn with_parts(store: Arc<ServerSideStore>, clients: Arc<ClientRegistry>) -> Self {
        Self {
            store,
            clients,
            known_buckets: DashSet::new(),
            pending_invalidations: Mutex::new(BTreeSet::new()),
            clear_pending: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ServerSideStore> {
        &self.store
    }

    #[must_use]
    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    /// Applies one replication message.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolMisuse::UntrackedClient`] for chain or clear
    /// messages from a client that was never tracked.
    pub fn apply(&self, message: &ReplicationMessage) -> Result<(), ReplicationError> {
        match message {
            ReplicationMessage::ClientIdTrack { client_id } => {
                self.clients.track(*client_id);
            }
            ReplicationMessage::ChainReplication {
                bucket,
                chain,
                client_id,
                message_id,
                oldest_outstanding,
            } => {
                self.require_tracked(*client_id)?;
                self.store.install(*bucket, chain.clone());
                self.clients.track_message(*client_id, *message_id);
                self.clients.prune_messages(*client_id, *oldest_outstanding);
                self.known_buckets.insert(*bucket);
                self.pending_invalidations.lock().insert(*bucket);
                debug!(bucket, client = %client_id, message_id, len = chain.len(), "installed replicated chain");
            }
            ReplicationMessage::ClearReplication {
                client_id,
                message_id,
                oldest_outstanding,
            } => {
                self.require_tracked(*client_id)?;
                self.store.clear();
                self.known_buckets.clear();
                self.clients.track_message(*client_id, *message_id);
                self.clients.prune_messages(*client_id, *oldest_outstanding);
                self.clear_pending.store(true, Ordering::Release);
                debug!(client = %client_id, message_id, "applied replicated clear");
            }
            ReplicationMessage::InvalidationComplete { bucket } => {
                if self.bucket_state(*bucket) == BucketState::Unknown {
                    debug!(bucket, "invalidation completed for a bucket with no replicated chain");
                }
                self.pending_invalidations.lock().remove(bucket);
            }
            ReplicationMessage::ClearInvalidationComplete => {
                self.clear_pending.store(false, Ordering::Release);
            }
        }
        Ok(())
    }

    fn require_tracked(&self, client: ClientId) -> Result<(), ProtocolMisuse> {
        if self.clients.is_tracked(client) {
            Ok(())
        } else {
            Err(ProtocolMisuse::UntrackedClient { client })
        }
    }

    #[must_use]
    pub fn bucket_state(&self, bucket: u64) -> BucketState {
        if self.known_buckets.contains(&bucket) {
            BucketState::Present
        } else {
            BucketState::Unknown
        }
    }

    /// Buckets with an invalidation still outstanding on the active.
    #[must_use]
    pub fn pending_invalidations(&self) -> Vec<u64> {
        self.pending_invalidations.lock().iter().copied().collect()
    }

    #[must_use]
    pub fn clear_pending(&self) -> bool {
        self.clear_pending.load(Ordering::Acquire)
    }

    /// Turns this replica into the seed state of a new active.
    ///
    /// Client identities and their message watermarks carry over; every
    /// client starts out detached and must reconnect.
    #[must_use]
    pub fn promote(&self) -> PromotedState {
        let pending_buckets = self.pending_invalidations();
        let clear_pending = self.clear_pending();
        self.clients.reset_attachments();
        info!(
            buckets = self.store.len(),
            clients = self.clients.len(),
            pending = pending_buckets.len(),
            clear_pending,
            "passive promoted"
        );
        PromotedState {
            store: Arc::clone(&self.store),
            clients: Arc::clone(&self.clients),
            pending_buckets,
            clear_pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tiercache_core::{Chain, Key, Operation, Resolution, Timestamp};

    use super::*;
    use crate::storage::{StoreChange, StoreObserver, StoreStats};

    fn replica() -> PassiveReplica {
        PassiveReplica::new(8, Arc::default())
    }

    fn chain_of(values: &[&str]) -> Chain {
        let ops: Vec<Operation> = values
            .iter()
            .map(|v| Operation::put(Key::from("k"), v.as_bytes().to_vec(), Timestamp::default()))
            .collect();
        Chain::from_operations(&ops).unwrap()
    }

    fn chain_msg(client: ClientId, bucket: u64, chain: Chain, message_id: u64) -> ReplicationMessage {
        ReplicationMessage::ChainReplication {
            bucket,
            chain,
            client_id: client,
            message_id,
            oldest_outstanding: message_id,
        }
    }

    #[test]
    fn chain_before_track_is_rejected() {
        let replica = replica();
        let client = ClientId::random();

        let err = replica
            .apply(&chain_msg(client, 1, chain_of(&["a"]), 1))
            .unwrap_err();

        assert_eq!(
            err,
            ReplicationError::ProtocolMisuse(ProtocolMisuse::UntrackedClient { client })
        );
        assert_eq!(replica.bucket_state(1), BucketState::Unknown);
    }

    #[test]
    fn track_is_idempotent() {
        let replica = replica();
        let client = ClientId::random();
        let track = ReplicationMessage::ClientIdTrack { client_id: client };

        replica.apply(&track).unwrap();
        replica.apply(&track).unwrap();

        assert_eq!(replica.clients().len(), 1);
    }

    #[test]
    fn duplicate_delivery_converges_to_latest_chain() {
        let replica = replica();
        let client = ClientId::random();
        let key = Key::from("k");
        let bucket = key.bucket_hash();
        replica
            .apply(&ReplicationMessage::ClientIdTrack { client_id: client })
            .unwrap();

        let first = chain_msg(client, bucket, chain_of(&["a"]), 1);
        let second = chain_msg(client, bucket, chain_of(&["a", "b"]), 2);
        replica.apply(&first).unwrap();
        replica.apply(&second).unwrap();
        replica.apply(&second).unwrap();

        assert_eq!(
            replica.store().get(bucket).operations().unwrap(),
            chain_of(&["a", "b"]).operations().unwrap()
        );
        assert_eq!(
            replica.store().get_value(&key).unwrap(),
            Resolution::Present(b"b".to_vec())
        );
        assert_eq!(replica.clients().last_message_id(client), Some(2));
        assert_eq!(replica.bucket_state(bucket), BucketState::Present);
    }

    #[test]
    fn shadow_invalidations_follow_completion() {
        let replica = replica();
        let client = ClientId::random();
        replica
            .apply(&ReplicationMessage::ClientIdTrack { client_id: client })
            .unwrap();

        replica.apply(&chain_msg(client, 1, chain_of(&["a"]), 1)).unwrap();
        replica.apply(&chain_msg(client, 2, chain_of(&["b"]), 2)).unwrap();
        assert_eq!(replica.pending_invalidations(), vec![1, 2]);

        replica
            .apply(&ReplicationMessage::InvalidationComplete { bucket: 1 })
            .unwrap();
        assert_eq!(replica.pending_invalidations(), vec![2]);

        // Completion for a bucket that was never pending is harmless.
        replica
            .apply(&ReplicationMessage::InvalidationComplete { bucket: 9 })
            .unwrap();
        assert_eq!(replica.pending_invalidations(), vec![2]);
    }

    #[test]
    fn clear_replication_wipes_store_and_flags_clear() {
        let replica = replica();
        let client = ClientId::random();
        replica
            .apply(&ReplicationMessage::ClientIdTrack { client_id: client })
            .unwrap();
        replica.apply(&chain_msg(client, 1, chain_of(&["a"]), 1)).unwrap();

        replica
            .apply(&ReplicationMessage::ClearReplication {
                client_id: client,
                message_id: 2,
                oldest_outstanding: 2,
            })
            .unwrap();

        assert!(replica.store().is_empty());
        assert!(replica.clear_pending());
        assert_eq!(replica.bucket_state(1), BucketState::Unknown);

        replica
            .apply(&ReplicationMessage::ClearInvalidationComplete)
            .unwrap();
        assert!(!replica.clear_pending());
    }

    #[test]
    fn promote_hands_over_state() {
        let replica = replica();
        let client = ClientId::random();
        replica
            .apply(&ReplicationMessage::ClientIdTrack { client_id: client })
            .unwrap();
        replica.apply(&chain_msg(client, 5, chain_of(&["a"]), 7)).unwrap();

        let promoted = replica.promote();

        assert_eq!(promoted.pending_buckets, vec![5]);
        assert!(!promoted.clear_pending);
        assert!(promoted.clients.is_tracked(client));
        assert!(!promoted.clients.is_attached(client));
        assert_eq!(promoted.clients.last_message_id(client), Some(7));
        assert!(promoted.store.contains(5));
    }

    #[test]
    fn independent_replicas_converge_under_redelivery() {
        let client = ClientId::random();
        let key = Key::from("k");
        let bucket = key.bucket_hash();
        let sequence = vec![
            ReplicationMessage::ClientIdTrack { client_id: client },
            chain_msg(client, bucket, chain_of(&["a"]), 1),
            chain_msg(client, 3, chain_of(&["x"]), 2),
            chain_msg(client, bucket, chain_of(&["a", "b"]), 3),
            ReplicationMessage::InvalidationComplete { bucket: 3 },
            chain_msg(client, bucket, chain_of(&["a", "b", "c"]), 4),
        ];
        let left = replica();
        let right = replica();

        for message in &sequence {
            left.apply(message).unwrap();
            right.apply(message).unwrap();
        }
        if let Some(last) = sequence.last() {
            right.apply(last).unwrap();
        }

        for bucket in [bucket, 3] {
            assert_eq!(
                left.store().get(bucket).operations().unwrap(),
                right.store().get(bucket).operations().unwrap()
            );
            assert_eq!(left.bucket_state(bucket), right.bucket_state(bucket));
        }
        assert_eq!(
            left.store().get_value(&key).unwrap(),
            Resolution::Present(b"c".to_vec())
        );
        assert_eq!(
            left.store().get_value(&key).unwrap(),
            right.store().get_value(&key).unwrap()
        );
        assert_eq!(left.pending_invalidations(), right.pending_invalidations());
        assert_eq!(
            left.clients().last_message_id(client),
            right.clients().last_message_id(client)
        );
    }

    #[test]
    fn replicated_watermark_bounds_dedup_state() {
        let replica = replica();
        let client = ClientId::random();
        replica
            .apply(&ReplicationMessage::ClientIdTrack { client_id: client })
            .unwrap();

        for message_id in (2..=200).step_by(2) {
            replica
                .apply(&chain_msg(client, 1, chain_of(&["a"]), message_id))
                .unwrap();
        }

        assert_eq!(replica.clients().sparse_message_ids(client), 0);
        let promoted = replica.promote();
        assert_eq!(promoted.clients.last_message_id(client), Some(200));
        assert_eq!(
            promoted.clients.track_message(client, 99),
            Some(crate::clients::Dedup::Duplicate)
        );
    }

    #[derive(Default)]
    struct CountingObserver {
        installed: AtomicUsize,
        appended: AtomicUsize,
    }

    impl StoreObserver for CountingObserver {
        fn on_change(&self, change: &StoreChange, _stats: &StoreStats) {
            match change {
                StoreChange::Installed { .. } => {
                    self.installed.fetch_add(1, Ordering::Relaxed);
                }
                StoreChange::Appended { .. } => {
                    self.appended.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            }
        }
    }

    #[test]
    fn observer_follows_the_store_through_promotion() {
        let counting = Arc::new(CountingObserver::default());
        let observer = CompositeStoreObserver::new(vec![Arc::clone(&counting) as _]);
        let replica = PassiveReplica::new(8, Arc::new(observer));
        let client = ClientId::random();
        replica
            .apply(&ReplicationMessage::ClientIdTrack { client_id: client })
            .unwrap();
        replica.apply(&chain_msg(client, 1, chain_of(&["a"]), 1)).unwrap();
        assert_eq!(counting.installed.load(Ordering::Relaxed), 1);

        let promoted = replica.promote();
        promoted
            .store
            .append(
                1,
                &Operation::put(Key::from("k"), b"b".to_vec(), Timestamp::default()),
            )
            .unwrap();

        assert_eq!(counting.appended.load(Ordering::Relaxed), 1);
    }
}
