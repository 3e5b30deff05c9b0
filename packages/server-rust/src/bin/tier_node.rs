//! Runs an active and a passive tier node in one process, drives a client
//! workload through the active, then fails over to the passive.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tiercache_core::{Key, Resolution};
use tiercache_server::clients::{ChannelNotifier, ClientInvalidation};
use tiercache_server::replication::ReplicationFailure;
use tiercache_server::service::CompactionService;
use tiercache_server::storage::{CompositeStoreObserver, HashMapChainStorage};
use tiercache_server::telemetry::{init_tracing, LogFormat};
use tiercache_server::{
    ActiveReplicator, ActiveTier, ClientId, ClientRegistry, Consistency, InProcessTransport,
    MutationRequest, PassiveReplica, ReplicationMode, ServerSideStore, TierConfig, TierError,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tier-node", about = "In-process active/passive tier node")]
struct Args {
    /// JSON tier configuration; unset fields keep their defaults.
    #[arg(long, env = "TIER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "TIER_NODE_ID")]
    node_id: Option<String>,

    /// Acknowledge mutations before the passive applied them.
    #[arg(long, env = "TIER_ASYNC_REPLICATION")]
    async_replication: bool,

    /// Do not wait for client invalidations before acknowledging.
    #[arg(long, env = "TIER_EVENTUAL")]
    eventual: bool,

    #[arg(long, env = "TIER_COMPACTION_THRESHOLD")]
    compaction_threshold: Option<usize>,

    /// Number of simulated clients.
    #[arg(long, default_value_t = 3)]
    clients: usize,

    /// Mutations issued per client.
    #[arg(long, default_value_t = 32)]
    mutations: u64,

    /// Distinct keys the workload cycles through.
    #[arg(long, default_value_t = 8)]
    keys: u64,

    /// `pretty` or `json`.
    #[arg(long, env = "TIER_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,
}

impl Args {
    fn tier_config(&self) -> anyhow::Result<TierConfig> {
        let mut config = match &self.config {
            Some(path) => TierConfig::from_json_file(path)?,
            None => TierConfig::default(),
        };
        if let Some(node_id) = &self.node_id {
            config.node_id.clone_from(node_id);
        }
        if self.async_replication {
            config.replication_mode = ReplicationMode::Async;
        }
        if self.eventual {
            config.consistency = Consistency::Eventual;
        }
        if let Some(threshold) = self.compaction_threshold {
            config.compaction_threshold = threshold;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Plays every client: acknowledges each invalidation as it arrives.
fn spawn_acknowledger(tier: Arc<ActiveTier>, mut rx: UnboundedReceiver<ClientInvalidation>) {
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            if let Err(e) = tier
                .acknowledge_invalidation(request.client(), request.id())
                .await
            {
                warn!(client = %request.client(), error = %e, "invalidation ack failed");
            }
        }
    });
}

fn new_store(config: &TierConfig) -> Arc<ServerSideStore> {
    Arc::new(ServerSideStore::new(
        Arc::new(HashMapChainStorage::new()),
        config.compaction_threshold,
        Arc::new(CompositeStoreObserver::default()),
    ))
}

fn spawn_failure_logger(mut failures: UnboundedReceiver<ReplicationFailure>) {
    tokio::spawn(async move {
        while let Some(failure) = failures.recv().await {
            error!(kind = failure.kind, error = %failure.error, "passive out of sync");
        }
    });
}

fn key_for(i: u64, keys: u64) -> Key {
    Key::from(format!("key-{}", i % keys.max(1)).as_str())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format)?;
    let config = args.tier_config()?;
    info!(?config, "starting tier node");

    let passive = Arc::new(PassiveReplica::new(
        config.compaction_threshold,
        Arc::new(CompositeStoreObserver::default()),
    ));
    let transport = Arc::new(InProcessTransport::start(
        Arc::clone(&passive),
        config.replication_queue_capacity,
    ));
    let (replicator, failures) = ActiveReplicator::new(transport.clone(), config.replication_mode);
    spawn_failure_logger(failures);

    let store = new_store(&config);
    let compaction = Arc::new(CompactionService::start(
        Arc::clone(&store),
        config.compaction_interval_ms,
    ));
    let (notifier, invalidations) = ChannelNotifier::new();
    let active = Arc::new(
        ActiveTier::new(
            config.clone(),
            store,
            Arc::new(ClientRegistry::default()),
            replicator,
            Arc::new(notifier),
        )
        .with_compaction(Arc::clone(&compaction)),
    );
    spawn_acknowledger(Arc::clone(&active), invalidations);

    let clients: Vec<ClientId> = (0..args.clients).map(|_| ClientId::random()).collect();
    for client in &clients {
        active.attach_client(*client).await?;
        active.validate_client(*client);
    }

    let mut workers = Vec::with_capacity(clients.len());
    for (index, client) in clients.iter().copied().enumerate() {
        let tier = Arc::clone(&active);
        let (mutations, keys) = (args.mutations, args.keys);
        workers.push(tokio::spawn(async move {
            for message_id in 1..=mutations {
                let value = format!("client-{index}-msg-{message_id}").into_bytes();
                let request = MutationRequest::put(
                    client,
                    message_id,
                    key_for(message_id + index as u64, keys),
                    value,
                );
                tier.mutate(request).await?;
            }
            Ok::<_, TierError>(())
        }));
    }
    for worker in workers {
        worker.await.context("client task panicked")??;
    }
    info!(stats = ?active.stats(), "workload finished on active");

    let expected: Vec<(Key, Resolution)> = (0..args.keys)
        .map(|i| {
            let key = key_for(i, args.keys);
            active.get(&key).map(|value| (key, value))
        })
        .collect::<Result<_, _>>()?;

    // Fail over: stop feeding the passive and promote it.
    compaction.stop().await;
    transport.stop().await;
    let promoted = passive.promote();

    let standby = Arc::new(PassiveReplica::new(
        config.compaction_threshold,
        Arc::new(CompositeStoreObserver::default()),
    ));
    let standby_transport = Arc::new(InProcessTransport::start(
        standby,
        config.replication_queue_capacity,
    ));
    let (replicator, failures) =
        ActiveReplicator::new(standby_transport.clone(), config.replication_mode);
    spawn_failure_logger(failures);
    let (notifier, invalidations) = ChannelNotifier::new();
    let resumed = Arc::new(ActiveTier::resume(
        config.clone(),
        promoted,
        replicator,
        Arc::new(notifier),
    ));
    spawn_acknowledger(Arc::clone(&resumed), invalidations);

    for client in &clients {
        resumed.attach_client(*client).await?;
        resumed.validate_client(*client);
    }
    let reissued = resumed.resume_pending_invalidations().await?;
    for ticket in reissued {
        ticket.wait().await;
    }

    let mut mismatches = 0usize;
    for (key, value) in &expected {
        let after = resumed.get(key)?;
        if &after != value {
            mismatches += 1;
            error!(?key, before = ?value, ?after, "value changed across failover");
        }
    }
    standby_transport.stop().await;

    let stats = serde_json::to_string_pretty(&resumed.stats())?;
    info!(mismatches, "failover finished");
    println!("{stats}");
    anyhow::ensure!(
        mismatches == 0 || config.replication_mode == ReplicationMode::Async,
        "{mismatches} keys diverged after failover"
    );
    Ok(())
}
