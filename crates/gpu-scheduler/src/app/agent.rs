use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Result;
use tokio::sync::mpsc;

use super::Tasks;
use crate::config::AgentArgs;
use crate::config::RELIST_CHANNEL_CAPACITY;
use crate::domain::allocation::AllocationRelister;
use crate::domain::allocation::RelisterChannels;
use crate::domain::inventory::DeviceCache;
use crate::domain::inventory::InventoryScanner;
use crate::domain::liveness::HealthChecker;
use crate::infrastructure::k8s::init_kube_client;
use crate::infrastructure::k8s::LeaseRenewer;
use crate::infrastructure::k8s::PodWatcher;
use crate::infrastructure::nvml::NvmlDevices;
use crate::infrastructure::pod_resources::KubeletPodResources;
use crate::infrastructure::server_client::ServerClient;

/// Node agent: scans local devices, relists kubelet allocations and pushes
/// both to the central service.
pub async fn run(args: AgentArgs) -> Result<()> {
    if args.node_name.trim().is_empty() {
        return Err(anyhow!("node name must be set (--node-name or NODENAME)"));
    }
    let node_name = args.node_name.clone();
    tracing::info!(node_name = %node_name, server_url = %args.server_url, "Starting node agent");

    let devices = NvmlDevices::new().map_err(|e| anyhow!("{e:?}"))?;
    let cache = Arc::new(DeviceCache::new(
        node_name.clone(),
        args.device_cache_ttl(),
        Arc::new(devices),
    ));
    let server = ServerClient::new(args.server_url.clone(), node_name.clone())
        .map_err(|e| anyhow!("{e:?}"))?;
    let health = HealthChecker::new(
        Arc::new(server.clone()),
        args.health_probe_timeout(),
        args.health_probe_workers,
        args.health_check_interval(),
    );
    let relister = AllocationRelister::new(
        cache.clone(),
        Arc::new(KubeletPodResources::new(args.pod_resources_socket.clone())),
        Arc::new(server),
        health,
        args.health_check_interval(),
        args.relist_interval(),
    );
    let scanner = InventoryScanner::new(cache, args.scan_interval());
    let kube = init_kube_client(args.kubeconfig.clone())
        .await
        .map_err(|e| anyhow!("{e:?}"))?;

    let (relist_tx, relist_rx) = mpsc::channel(RELIST_CHANNEL_CAPACITY);
    let (removal_tx, removal_rx) = mpsc::channel(RELIST_CHANNEL_CAPACITY);
    let (inventory_tx, inventory_rx) = mpsc::channel(RELIST_CHANNEL_CAPACITY);
    let channels = RelisterChannels {
        relist: relist_rx,
        removals: removal_rx,
        inventory: inventory_rx,
    };

    let mut tasks = Tasks::new();
    tasks.spawn("inventory scanner", move |token| scanner.run(inventory_tx, token));
    tasks.spawn("allocation relister", move |token| relister.run(channels, token));
    let watcher = PodWatcher::new(kube.clone(), node_name.clone());
    tasks.spawn("pod watcher", move |token| watcher.run(relist_tx, removal_tx, token));
    if args.enable_lease {
        let renewer = LeaseRenewer::new(kube, node_name, args.lease_duration());
        tasks.spawn("lease renewer", move |token| renewer.run(token));
    }

    tasks.wait_for_completion().await?;
    tracing::info!("Node agent stopped");
    Ok(())
}
