use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Result;
use kube::Client;
use tokio::sync::watch;

use super::Tasks;
use crate::api::ApiServer;
use crate::api::ApiState;
use crate::api::IngestTarget;
use crate::config::ServerArgs;
use crate::config::StoreMode;
use crate::config::LEADER_LOCK_NAME;
use crate::config::LEASE_NAMESPACE;
use crate::config::WATCHER_CHANNEL_CAPACITY;
use crate::domain::index::ResourceIndex;
use crate::domain::liveness::NodeHealthTracker;
use crate::domain::scheduler::Framework;
use crate::domain::scheduler::Registry;
use crate::domain::scheduler::SchedulerService;
use crate::infrastructure::k8s::ensure_lease_namespace;
use crate::infrastructure::k8s::init_kube_client;
use crate::infrastructure::k8s::CrdMirror;
use crate::infrastructure::k8s::CrdStore;
use crate::infrastructure::k8s::LeaderElector;
use crate::infrastructure::k8s::LeaseMonitor;

/// Central service: resource index, scheduling engine and HTTP API, plus
/// the persisted-record plumbing in crd mode.
pub async fn run(args: ServerArgs) -> Result<()> {
    tracing::info!(
        listen_addr = %args.listen_addr,
        store_mode = ?args.store_mode,
        parallelism = args.parallelism(),
        "Starting scheduler service"
    );
    let mut tasks = Tasks::new();

    let (index, actor) = ResourceIndex::new(WATCHER_CHANNEL_CAPACITY);
    tasks.spawn("resource index", move |token| actor.run(token));

    let registry = Registry::in_tree();
    tracing::info!(plugins = ?registry.names().collect::<Vec<_>>(), "scheduler plugins registered");
    let scheduler = Arc::new(SchedulerService::new(
        Framework::new(&registry),
        index.clone(),
        args.parallelism(),
    ));

    let (ingest, tracker) = match args.store_mode {
        StoreMode::Memory => (
            IngestTarget::Memory(index.clone()),
            NodeHealthTracker::new(args.node_health_ttl(), Some(index.clone())),
        ),
        StoreMode::Crd => {
            let client = init_kube_client(args.kubeconfig.clone())
                .await
                .map_err(|e| anyhow!("{e:?}"))?;
            let store = Arc::new(CrdStore::new(client.clone()));

            let mirror = CrdMirror::new(client.clone(), index.clone());
            let nodes_synced = mirror.nodes_synced();
            tasks.spawn("crd mirror", move |token| mirror.run(token));
            spawn_lifecycle_monitor(&mut tasks, &args, client, store.clone(), index.clone(), nodes_synced);

            // lease health is written by the monitor, heartbeats are only logged
            (
                IngestTarget::Store(store),
                NodeHealthTracker::new(args.node_health_ttl(), None),
            )
        }
    };
    let tracker = Arc::new(tracker);

    {
        let tracker = tracker.clone();
        let interval = args.node_health_check_interval();
        tasks.spawn("node health tracker", move |token| tracker.run(interval, token));
    }

    let server = ApiServer::new(
        ApiState {
            scheduler,
            ingest,
            tracker,
            index,
        },
        args.listen_addr.clone(),
    );
    tasks.spawn("API server", move |token| async move {
        if let Err(e) = server.run(token).await {
            tracing::error!("API server failed: {e:?}");
        }
    });

    tasks.wait_for_completion().await?;
    tracing::info!("Scheduler service stopped");
    Ok(())
}

fn spawn_lifecycle_monitor(
    tasks: &mut Tasks,
    args: &ServerArgs,
    client: Client,
    store: Arc<CrdStore>,
    index: ResourceIndex,
    nodes_synced: watch::Receiver<bool>,
) {
    let grace = args.monitor_grace_period();
    let period = args.monitor_period();
    let elector = LeaderElector::new(client.clone(), LEASE_NAMESPACE, LEADER_LOCK_NAME, args.identity());

    tasks.spawn("lifecycle leader election", move |token| async move {
        if let Err(e) = ensure_lease_namespace(&client).await {
            tracing::warn!("failed to ensure lease namespace: {e:?}");
        }
        elector
            .run(token, move |leading| {
                let monitor = LeaseMonitor::new(
                    client.clone(),
                    store.clone(),
                    index.clone(),
                    grace,
                    period,
                    nodes_synced.clone(),
                );
                monitor.run(leading)
            })
            .await;
    });
}
