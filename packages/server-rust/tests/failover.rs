//! Active → passive failover, end to end through the in-process transport.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tiercache_core::{Key, Resolution};
use tiercache_server::clients::{Attachment, ChannelNotifier, ClientInvalidation};
use tiercache_server::replication::ReplicationFailure;
use tiercache_server::storage::{CompositeStoreObserver, HashMapChainStorage};
use tiercache_server::tier::MutationKind;
use tiercache_server::{
    ActiveReplicator, ActiveTier, ClientId, ClientRegistry, Consistency, InProcessTransport,
    MutationAck, MutationRequest, PassiveReplica, ReplicationMode, ServerSideStore, TierConfig,
};
use tokio::sync::mpsc::UnboundedReceiver;

struct Node {
    tier: Arc<ActiveTier>,
    passive: Arc<PassiveReplica>,
    transport: Arc<InProcessTransport>,
    invalidations: UnboundedReceiver<ClientInvalidation>,
    _failures: UnboundedReceiver<ReplicationFailure>,
}

fn config(consistency: Consistency) -> TierConfig {
    TierConfig {
        consistency,
        compaction_threshold: 3,
        ..TierConfig::default()
    }
}

fn start(config: &TierConfig) -> Node {
    let passive = Arc::new(PassiveReplica::new(config.compaction_threshold, Arc::default()));
    let transport = Arc::new(InProcessTransport::start(Arc::clone(&passive), 64));
    let (replicator, failures) = ActiveReplicator::new(transport.clone(), ReplicationMode::Sync);
    let (notifier, invalidations) = ChannelNotifier::new();
    let store = Arc::new(ServerSideStore::new(
        Arc::new(HashMapChainStorage::new()),
        config.compaction_threshold,
        Arc::new(CompositeStoreObserver::default()),
    ));
    let tier = ActiveTier::new(
        config.clone(),
        store,
        Arc::new(ClientRegistry::default()),
        replicator,
        Arc::new(notifier),
    );
    Node {
        tier: Arc::new(tier),
        passive,
        transport,
        invalidations,
        _failures: failures,
    }
}

/// Promotes `node`'s passive into a new active backed by a fresh passive.
async fn fail_over(node: Node, config: &TierConfig) -> Node {
    node.transport.stop().await;
    let promoted = node.passive.promote();
    let passive = Arc::new(PassiveReplica::new(config.compaction_threshold, Arc::default()));
    let transport = Arc::new(InProcessTransport::start(Arc::clone(&passive), 64));
    let (replicator, failures) = ActiveReplicator::new(transport.clone(), ReplicationMode::Sync);
    let (notifier, invalidations) = ChannelNotifier::new();
    let tier = ActiveTier::resume(config.clone(), promoted, replicator, Arc::new(notifier));
    Node {
        tier: Arc::new(tier),
        passive,
        transport,
        invalidations,
        _failures: failures,
    }
}

#[tokio::test]
async fn promoted_passive_serves_every_acknowledged_write() {
    let config = config(Consistency::Eventual);
    let node = start(&config);
    let client = ClientId::random();
    node.tier.attach_client(client).await.unwrap();

    for (id, key) in ["a", "b", "c", "a", "a", "a"].iter().enumerate() {
        let value = format!("{key}-{id}").into_bytes();
        node.tier
            .mutate(MutationRequest::put(client, id as u64 + 1, Key::from(*key), value))
            .await
            .unwrap();
    }
    node.tier
        .mutate(MutationRequest::remove(client, 7, Key::from("b")))
        .await
        .unwrap();

    let node = fail_over(node, &config).await;

    assert_eq!(
        node.tier.get(&Key::from("a")).unwrap(),
        Resolution::Present(b"a-5".to_vec())
    );
    assert_eq!(node.tier.get(&Key::from("b")).unwrap(), Resolution::Absent);
    assert_eq!(
        node.tier.get(&Key::from("c")).unwrap(),
        Resolution::Present(b"c-2".to_vec())
    );
}

#[tokio::test]
async fn retried_message_after_failover_is_a_duplicate() {
    let config = config(Consistency::Eventual);
    let node = start(&config);
    let client = ClientId::random();
    node.tier.attach_client(client).await.unwrap();
    node.tier
        .mutate(MutationRequest::put(client, 1, Key::from("k"), b"v1".to_vec()))
        .await
        .unwrap();

    let node = fail_over(node, &config).await;
    assert_eq!(
        node.tier.attach_client(client).await.unwrap(),
        Attachment::Reattached
    );

    // The client never saw the ack and resends under the same id.
    let retry = node
        .tier
        .mutate(MutationRequest::put(client, 1, Key::from("k"), b"v1".to_vec()))
        .await
        .unwrap();
    assert_eq!(retry, MutationAck::Duplicate);

    let next = node
        .tier
        .mutate(MutationRequest::new(
            client,
            2,
            Key::from("k"),
            MutationKind::Replace {
                value: b"v2".to_vec(),
            },
        ))
        .await
        .unwrap();
    assert!(matches!(next, MutationAck::Applied { .. }));
    assert_eq!(
        node.tier.get(&Key::from("k")).unwrap(),
        Resolution::Present(b"v2".to_vec())
    );
    // The new passive follows the new active.
    assert_eq!(
        node.passive.store().get_value(&Key::from("k")).unwrap(),
        Resolution::Present(b"v2".to_vec())
    );
}

#[tokio::test]
async fn unacknowledged_invalidations_are_reissued_after_failover() {
    let config = config(Consistency::Eventual);
    let mut node = start(&config);
    let writer = ClientId::random();
    let reader = ClientId::random();
    node.tier.attach_client(writer).await.unwrap();
    node.tier.attach_client(reader).await.unwrap();

    node.tier
        .mutate(MutationRequest::put(writer, 1, Key::from("x"), b"1".to_vec()))
        .await
        .unwrap();
    node.tier.clear(writer, 2, 2).await.unwrap();
    // The reader receives both requests but dies before acknowledging.
    let _ = node.invalidations.recv().await.unwrap();
    let _ = node.invalidations.recv().await.unwrap();

    let mut node = fail_over(node, &config).await;
    node.tier.attach_client(reader).await.unwrap();
    let tickets = node.tier.resume_pending_invalidations().await.unwrap();
    assert_eq!(tickets.len(), 2);

    let mut saw_hash = false;
    let mut saw_all = false;
    for _ in 0..2 {
        let request = node.invalidations.recv().await.unwrap();
        assert_eq!(request.client(), reader);
        match request {
            ClientInvalidation::Hash { bucket, .. } => {
                assert_eq!(bucket, Key::from("x").bucket_hash());
                saw_hash = true;
            }
            ClientInvalidation::All { .. } => saw_all = true,
        }
        node.tier
            .acknowledge_invalidation(reader, request.id())
            .await
            .unwrap();
    }
    assert!(saw_hash && saw_all);

    for ticket in tickets {
        tokio::time::timeout(Duration::from_secs(1), ticket.wait())
            .await
            .unwrap();
    }
    assert_eq!(node.tier.pending_invalidations(), 0);
    assert!(node.passive.pending_invalidations().is_empty());
    assert!(!node.passive.clear_pending());
}

#[tokio::test]
async fn strong_retry_after_failover_waits_for_the_inherited_invalidation() {
    let config = config(Consistency::Strong);
    let mut node = start(&config);
    let writer = ClientId::random();
    let reader = ClientId::random();
    let bucket = Key::from("k").bucket_hash();
    node.tier.attach_client(writer).await.unwrap();
    node.tier.attach_client(reader).await.unwrap();

    let tier = Arc::clone(&node.tier);
    let original = tokio::spawn(async move {
        tier.mutate(MutationRequest::put(writer, 1, Key::from("k"), b"v".to_vec()))
            .await
    });
    // The reader is told but never acknowledges before the active dies.
    assert_eq!(node.invalidations.recv().await.unwrap().client(), reader);
    tokio::time::timeout(Duration::from_secs(1), async {
        while node.passive.pending_invalidations() != vec![bucket] {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    original.abort();

    let mut node = fail_over(node, &config).await;
    node.tier.attach_client(writer).await.unwrap();
    node.tier.attach_client(reader).await.unwrap();

    // The writer never saw its ack and resends under the same id.
    let tier = Arc::clone(&node.tier);
    let retry = tokio::spawn(async move {
        tier.mutate(MutationRequest::put(writer, 1, Key::from("k"), b"v".to_vec()))
            .await
    });
    let mut requests = Vec::new();
    for _ in 0..2 {
        let request = tokio::time::timeout(Duration::from_secs(1), node.invalidations.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(
            matches!(request, ClientInvalidation::Hash { bucket: b, .. } if b == bucket)
        );
        requests.push(request);
    }
    let mut notified: Vec<ClientId> = requests.iter().map(ClientInvalidation::client).collect();
    notified.sort();
    let mut expected = vec![writer, reader];
    expected.sort();
    assert_eq!(notified, expected);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!retry.is_finished());

    for request in requests {
        node.tier
            .acknowledge_invalidation(request.client(), request.id())
            .await
            .unwrap();
    }
    let ack = tokio::time::timeout(Duration::from_secs(1), retry)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(ack, MutationAck::Duplicate);
    assert_eq!(node.tier.pending_invalidations(), 0);
    // The retry already drained this bucket's inherited round.
    assert!(node.tier.resume_pending_invalidations().await.unwrap().is_empty());
    assert_eq!(
        node.tier.get(&Key::from("k")).unwrap(),
        Resolution::Present(b"v".to_vec())
    );
}

#[tokio::test]
async fn strong_writes_complete_once_lagging_client_disconnects() {
    let config = config(Consistency::Strong);
    let mut node = start(&config);
    let writer = ClientId::random();
    let lagging = ClientId::random();
    node.tier.attach_client(writer).await.unwrap();
    node.tier.attach_client(lagging).await.unwrap();

    let tier = Arc::clone(&node.tier);
    let pending = tokio::spawn(async move {
        tier.mutate(MutationRequest::put(writer, 1, Key::from("k"), b"v".to_vec()))
            .await
    });
    let request = node.invalidations.recv().await.unwrap();
    assert_eq!(request.client(), lagging);

    assert_eq!(node.tier.detach_client(lagging).await.unwrap(), 1);
    let ack = tokio::time::timeout(Duration::from_secs(1), pending)
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
    // A late ack from the departed client is ignored.
    assert!(!node
        .tier
        .acknowledge_invalidation(lagging, request.id())
        .await
        .unwrap());
}

#[derive(Debug, Clone)]
enum Step {
    Put(u8, u8),
    Remove(u8),
    ConditionalReplace(u8, u8, u8),
    ConditionalRemove(u8, u8),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0..4u8, any::<u8>()).prop_map(|(k, v)| Step::Put(k, v)),
        (0..4u8).prop_map(Step::Remove),
        (0..4u8, 0..4u8, any::<u8>()).prop_map(|(k, e, v)| Step::ConditionalReplace(k, e, v)),
        (0..4u8, 0..4u8).prop_map(|(k, e)| Step::ConditionalRemove(k, e)),
    ]
}

fn key(k: u8) -> Key {
    Key::from(format!("key-{k}").as_str())
}

fn request(client: ClientId, message_id: u64, step: &Step) -> MutationRequest {
    match *step {
        Step::Put(k, v) => MutationRequest::put(client, message_id, key(k), vec![v]),
        Step::Remove(k) => MutationRequest::remove(client, message_id, key(k)),
        Step::ConditionalReplace(k, e, v) => MutationRequest::new(
            client,
            message_id,
            key(k),
            MutationKind::ConditionalReplace {
                expected: vec![e],
                value: vec![v],
            },
        ),
        Step::ConditionalRemove(k, e) => MutationRequest::new(
            client,
            message_id,
            key(k),
            MutationKind::ConditionalRemove { expected: vec![e] },
        ),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn failover_preserves_every_resolution(steps in prop::collection::vec(step(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let config = config(Consistency::Eventual);
            let node = start(&config);
            let client = ClientId::random();
            node.tier.attach_client(client).await.unwrap();
            for (i, step) in steps.iter().enumerate() {
                node.tier.mutate(request(client, i as u64 + 1, step)).await.unwrap();
            }
            let before: Vec<Resolution> =
                (0..4).map(|k| node.tier.get(&key(k)).unwrap()).collect();

            let node = fail_over(node, &config).await;
            let after: Vec<Resolution> =
                (0..4).map(|k| node.tier.get(&key(k)).unwrap()).collect();
            prop_assert_eq!(before, after);
            Ok::<(), TestCaseError>(())
        })?;
    }
}
