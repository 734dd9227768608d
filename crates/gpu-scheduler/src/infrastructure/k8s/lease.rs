//! Node leases: renewed by every agent, watched by the elected monitor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use error_stack::Report;
use futures::StreamExt;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::coordination::v1::LeaseSpec;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::PostParams;
use kube::runtime::watcher::watcher;
use kube::runtime::watcher::Config;
use kube::runtime::watcher::Event;
use kube::Api;
use kube::Client;
use kube::Resource;
use kube::ResourceExt;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::crd::GpuNode;
use super::is_conflict;
use super::is_not_found;
use super::mirror::supervise;
use super::store::CrdStore;
use super::KubernetesError;
use crate::config::LEASE_NAMESPACE;
use crate::config::LEASE_RENEW_FRACTION;
use crate::domain::index::ResourceIndex;
use crate::domain::liveness::NodeLifecycle;

fn request_failed(what: &str, e: kube::Error) -> Report<KubernetesError> {
    Report::new(KubernetesError::RequestFailed {
        message: format!("{what}: {e}"),
    })
}

/// Interval at which an agent renews a lease of `duration`.
pub fn renew_interval(duration: Duration) -> Duration {
    duration.mul_f64(LEASE_RENEW_FRACTION)
}

/// Creates the lease namespace unless it exists.
pub async fn ensure_lease_namespace(client: &Client) -> Result<(), Report<KubernetesError>> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    if namespaces
        .get_opt(LEASE_NAMESPACE)
        .await
        .map_err(|e| request_failed("reading lease namespace", e))?
        .is_some()
    {
        return Ok(());
    }

    let mut namespace = Namespace::default();
    namespace.metadata.name = Some(LEASE_NAMESPACE.to_string());
    match namespaces.create(&PostParams::default(), &namespace).await {
        Ok(_) => {
            info!(namespace = LEASE_NAMESPACE, "created lease namespace");
            Ok(())
        }
        // created concurrently by another process
        Err(e) if is_conflict(&e) => Ok(()),
        Err(e) => Err(request_failed("creating lease namespace", e)),
    }
}

/// Keeps the agent's node lease fresh.
pub struct LeaseRenewer {
    client: Client,
    leases: Api<Lease>,
    nodes: Api<GpuNode>,
    node_name: String,
    duration: Duration,
}

impl LeaseRenewer {
    pub fn new(client: Client, node_name: String, duration: Duration) -> Self {
        Self {
            leases: Api::namespaced(client.clone(), LEASE_NAMESPACE),
            nodes: Api::all(client.clone()),
            client,
            node_name,
            duration,
        }
    }

    /// Owner reference to the node's `GpuNode`, once the record exists.
    async fn owner(&self) -> Option<OwnerReference> {
        match self.nodes.get_opt(&self.node_name).await {
            Ok(Some(node)) => node.owner_ref(&()),
            Ok(None) => None,
            Err(e) => {
                debug!(node_name = %self.node_name, "cannot read GpuNode for lease owner: {e}");
                None
            }
        }
    }

    /// Creates or renews the lease once.
    pub async fn renew_once(&self) -> Result<(), Report<KubernetesError>> {
        let now = MicroTime(Utc::now());
        let duration_secs = i32::try_from(self.duration.as_secs()).unwrap_or(i32::MAX);
        let owner = self.owner().await;

        let existing = self
            .leases
            .get_opt(&self.node_name)
            .await
            .map_err(|e| request_failed("reading node lease", e))?;

        let result = match existing {
            Some(mut lease) => {
                let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
                spec.holder_identity = Some(self.node_name.clone());
                spec.lease_duration_seconds = Some(duration_secs);
                spec.renew_time = Some(now);
                if let Some(owner) = owner {
                    let owners = lease.metadata.owner_references.get_or_insert_with(Vec::new);
                    if !owners.iter().any(|o| o.uid == owner.uid) {
                        owners.push(owner);
                    }
                }
                self.leases
                    .replace(&self.node_name, &PostParams::default(), &lease)
                    .await
            }
            None => {
                let mut lease = Lease::default();
                lease.metadata.name = Some(self.node_name.clone());
                lease.metadata.namespace = Some(LEASE_NAMESPACE.to_string());
                lease.metadata.owner_references = owner.map(|owner| vec![owner]);
                lease.spec = Some(LeaseSpec {
                    holder_identity: Some(self.node_name.clone()),
                    lease_duration_seconds: Some(duration_secs),
                    acquire_time: Some(now.clone()),
                    renew_time: Some(now),
                    lease_transitions: None,
                });
                self.leases.create(&PostParams::default(), &lease).await
            }
        };

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) || is_not_found(&e) => {
                debug!(node_name = %self.node_name, "lease changed underneath, retrying next tick");
                Ok(())
            }
            Err(e) => Err(request_failed("writing node lease", e)),
        }
    }

    #[tracing::instrument(skip_all, fields(node_name = %self.node_name))]
    pub async fn run(self, cancellation_token: CancellationToken) {
        let interval = renew_interval(self.duration);
        info!(?interval, "Starting lease renewer");

        while let Err(e) = ensure_lease_namespace(&self.client).await {
            warn!("failed to ensure lease namespace: {e:?}");
            tokio::select! {
                _ = cancellation_token.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Lease renewer shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.renew_once().await {
                        warn!("failed to renew node lease: {e:?}");
                    }
                }
            }
        }
    }
}

/// Leader side: turns lease renewals into `GpuNode` health writes.
pub struct LeaseMonitor {
    client: Client,
    store: Arc<CrdStore>,
    index: ResourceIndex,
    lifecycle: Mutex<NodeLifecycle>,
    period: Duration,
    nodes_synced: watch::Receiver<bool>,
}

impl LeaseMonitor {
    pub fn new(
        client: Client,
        store: Arc<CrdStore>,
        index: ResourceIndex,
        grace: Duration,
        period: Duration,
        nodes_synced: watch::Receiver<bool>,
    ) -> Self {
        Self {
            client,
            store,
            index,
            lifecycle: Mutex::new(NodeLifecycle::new(grace)),
            period,
            nodes_synced,
        }
    }

    async fn watch_leases(&self, leases_synced: &watch::Sender<bool>) -> Result<(), Report<KubernetesError>> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), LEASE_NAMESPACE);
        let mut stream = watcher(api, Config::default()).boxed();

        while let Some(event) = stream.next().await {
            let event = event.map_err(|e| KubernetesError::WatchFailed {
                message: format!("lease watch stream error: {e}"),
            })?;
            let now = Utc::now();
            let mut lifecycle = self.lifecycle.lock().await;
            match event {
                Event::Applied(lease) => observe(&mut lifecycle, &lease, now),
                Event::Deleted(_) => {}
                Event::Restarted(leases) => {
                    for lease in &leases {
                        observe(&mut lifecycle, lease, now);
                    }
                    leases_synced.send_replace(true);
                }
            }
        }
        Ok(())
    }

    /// Evaluates every indexed node once. `written` remembers the last
    /// health this monitor wrote so unchanged nodes cost no API call.
    async fn evaluate(&self, written: &mut HashMap<String, bool>) {
        let snapshot = match self.index.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("lease monitor cannot read index: {e:?}");
                return;
            }
        };
        let now = Utc::now();

        let decisions: Vec<(String, bool)> = {
            let mut lifecycle = self.lifecycle.lock().await;
            lifecycle.retain(snapshot.nodes.keys().map(String::as_str));
            snapshot
                .nodes
                .values()
                .filter_map(|node| {
                    let current = written
                        .get(&node.name)
                        .copied()
                        .or_else(|| node.health.as_ref().map(|h| h.healthy));
                    let healthy = lifecycle.evaluate(&node.name, current, now)?;
                    Some((node.name.clone(), healthy))
                })
                .collect()
        };
        written.retain(|name, _| snapshot.nodes.contains_key(name));

        for (node_name, healthy) in decisions {
            match self.store.set_health(&node_name, healthy, now).await {
                Ok(_) => {
                    if !healthy {
                        warn!(node_name = %node_name, "node lease expired");
                    }
                    written.insert(node_name, healthy);
                }
                Err(e) => warn!(node_name = %node_name, "failed to write node health: {e:?}"),
            }
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(self, cancellation_token: CancellationToken) {
        info!(period = ?self.period, "Starting lease monitor");
        let (leases_synced, mut leases_ready) = watch::channel(false);
        let mut nodes_ready = self.nodes_synced.clone();

        let monitor = async {
            // both caches must be warm before the first evaluation
            if leases_ready.wait_for(|ready| *ready).await.is_err()
                || nodes_ready.wait_for(|ready| *ready).await.is_err()
            {
                return;
            }
            info!("lease monitor caches synced");

            let mut written = HashMap::new();
            let mut ticker = tokio::time::interval(self.period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    _ = ticker.tick() => self.evaluate(&mut written).await,
                }
            }
        };

        tokio::select! {
            _ = supervise("Lease", &cancellation_token, || self.watch_leases(&leases_synced)) => {}
            _ = monitor => {}
            _ = cancellation_token.cancelled() => {}
        }
        info!("Lease monitor stopped");
    }
}

fn observe(lifecycle: &mut NodeLifecycle, lease: &Lease, now: chrono::DateTime<Utc>) {
    let renew_time = lease
        .spec
        .as_ref()
        .and_then(|spec| spec.renew_time.as_ref())
        .map(|MicroTime(at)| *at);
    lifecycle.observe(&lease.name_any(), renew_time, now);
}
