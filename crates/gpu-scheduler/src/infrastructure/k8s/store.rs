use std::collections::BTreeSet;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use api_types::AllocationUpdate;
use api_types::NodeInventory;
use api_types::PodAllocation;
use api_types::PodKey;
use chrono::DateTime;
use chrono::Utc;
use error_stack::Report;
use kube::api::DeleteParams;
use kube::api::ListParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::api::PostParams;
use kube::Api;
use kube::Client;
use kube::ResourceExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::crd::GpuNode;
use super::crd::GpuNodeSpec;
use super::crd::GpuNodeStatus;
use super::crd::GpuPod;
use super::crd::NODE_LABEL;
use super::is_conflict;
use super::is_not_found;
use super::KubernetesError;

const CONFLICT_ATTEMPTS: u32 = 3;
const CONFLICT_BACKOFF: Duration = Duration::from_millis(20);

/// Runs `op` again on write conflicts, with a short doubling backoff.
///
/// # Errors
///
/// - [`KubernetesError::Conflict`] when every attempt conflicted
/// - [`KubernetesError::RequestFailed`] on any other API error
pub async fn retry_on_conflict<T, F, Fut>(
    kind: &'static str,
    name: &str,
    mut op: F,
) -> Result<T, Report<KubernetesError>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, kube::Error>>,
{
    let mut backoff = CONFLICT_BACKOFF;
    for attempt in 1..=CONFLICT_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_conflict(&e) && attempt < CONFLICT_ATTEMPTS => {
                debug!(kind, name, attempt, "write conflict, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) if is_conflict(&e) => {
                return Err(Report::new(KubernetesError::Conflict {
                    kind,
                    name: name.to_string(),
                    attempts: attempt,
                })
                .attach_printable(e.to_string()));
            }
            Err(e) => {
                return Err(Report::new(KubernetesError::RequestFailed {
                    message: format!("{kind} {name}: {e}"),
                }));
            }
        }
    }
    Err(Report::new(KubernetesError::Conflict {
        kind,
        name: name.to_string(),
        attempts: CONFLICT_ATTEMPTS,
    }))
}

/// Canonical state persisted as `GpuNode` / `GpuPod` records.
///
/// Reads are served by the mirror; this type only writes. A pod that was
/// last written with the same content is not written again.
pub struct CrdStore {
    client: Client,
    nodes: Api<GpuNode>,
    last_written: Mutex<HashMap<PodKey, PodAllocation>>,
}

impl CrdStore {
    pub fn new(client: Client) -> Self {
        Self {
            nodes: Api::all(client.clone()),
            client,
            last_written: Mutex::new(HashMap::new()),
        }
    }

    fn pods(&self, namespace: &str) -> Api<GpuPod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn unchanged(&self, allocation: &PodAllocation) -> bool {
        self.last_written
            .lock()
            .map(|written| written.get(&allocation.key()) == Some(allocation))
            .unwrap_or(false)
    }

    fn remember(&self, allocation: Option<&PodAllocation>, key: &PodKey) {
        let Ok(mut written) = self.last_written.lock() else {
            return;
        };
        match allocation {
            Some(allocation) => written.insert(key.clone(), allocation.clone()),
            None => written.remove(key),
        };
    }

    /// Stores the inventory reported by a node, keeping its busy list.
    pub async fn apply_inventory(
        &self,
        inventory: &NodeInventory,
    ) -> Result<(), Report<KubernetesError>> {
        let name = inventory.node_name.as_str();
        retry_on_conflict("GpuNode", name, move || async move {
            match self.nodes.get_opt(name).await? {
                Some(mut node) => {
                    let busy = std::mem::take(&mut node.spec.busy);
                    node.spec = GpuNodeSpec::from_inventory(inventory, busy);
                    self.nodes.replace(name, &PostParams::default(), &node).await
                }
                None => {
                    let node = GpuNode::new(name, GpuNodeSpec::from_inventory(inventory, vec![]));
                    self.nodes.create(&PostParams::default(), &node).await
                }
            }
        })
        .await?;
        debug!(node_name = name, "inventory stored");
        Ok(())
    }

    async fn upsert_pod(&self, allocation: &PodAllocation) -> Result<(), Report<KubernetesError>> {
        let api = self.pods(&allocation.namespace);
        let desired = GpuPod::from_allocation(allocation);
        let name = allocation.name.as_str();
        let (api_ref, desired) = (&api, &desired);

        retry_on_conflict("GpuPod", name, move || async move {
            let api = api_ref;
            match api.get_opt(name).await? {
                Some(existing) => {
                    let mut updated = desired.clone();
                    updated.metadata.resource_version = existing.resource_version();
                    match api.replace(name, &PostParams::default(), &updated).await {
                        // deleted since the read
                        Err(e) if is_not_found(&e) => {
                            api.create(&PostParams::default(), desired).await
                        }
                        other => other,
                    }
                }
                None => api.create(&PostParams::default(), desired).await,
            }
        })
        .await?;

        let status = serde_json::json!({
            "status": { "last_changed_time": Utc::now() }
        });
        if let Err(e) = api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&status))
            .await
        {
            debug!(pod = %allocation.key(), "failed to stamp pod status: {e}");
        }
        Ok(())
    }

    async fn delete_pod(&self, key: &PodKey) -> Result<(), Report<KubernetesError>> {
        match self
            .pods(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Report::new(KubernetesError::RequestFailed {
                message: format!("GpuPod {key}: {e}"),
            })),
        }
    }

    async fn node_pods(&self, node_name: &str) -> Result<Vec<GpuPod>, Report<KubernetesError>> {
        let api: Api<GpuPod> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&format!("{NODE_LABEL}={node_name}"));
        api.list(&params)
            .await
            .map(|list| list.items)
            .map_err(|e| {
                Report::new(KubernetesError::RequestFailed {
                    message: format!("listing GpuPods of {node_name}: {e}"),
                })
            })
    }

    /// Applies one allocation batch of a node, then recomputes the node's
    /// busy list from every pod record left on it.
    pub async fn apply_allocations(
        &self,
        update: &AllocationUpdate,
    ) -> Result<(), Report<KubernetesError>> {
        let node_name = update.node_name.as_str();
        let mut failures = 0usize;

        if update.full_sync {
            let listed: BTreeSet<PodKey> = update.sync.iter().map(PodAllocation::key).collect();
            for stale in self.node_pods(node_name).await? {
                let key = stale.allocation().key();
                if listed.contains(&key) {
                    continue;
                }
                match self.delete_pod(&key).await {
                    Ok(()) => self.remember(None, &key),
                    Err(e) => {
                        failures += 1;
                        warn!(pod = %key, "failed to delete stale pod record: {e:?}");
                    }
                }
            }
        }

        for key in &update.delete {
            match self.delete_pod(key).await {
                Ok(()) => self.remember(None, key),
                Err(e) => {
                    failures += 1;
                    warn!(pod = %key, "failed to delete pod record: {e:?}");
                }
            }
        }

        for allocation in &update.sync {
            let mut allocation = allocation.clone();
            if allocation.node_name.is_empty() {
                allocation.node_name = node_name.to_string();
            }
            if self.unchanged(&allocation) {
                continue;
            }
            match self.upsert_pod(&allocation).await {
                Ok(()) => self.remember(Some(&allocation), &allocation.key()),
                Err(e) => {
                    failures += 1;
                    warn!(pod = %allocation.key(), "failed to store pod record: {e:?}");
                }
            }
        }

        self.refresh_busy(node_name).await?;
        if failures > 0 {
            return Err(Report::new(KubernetesError::RequestFailed {
                message: format!("{failures} pod record writes failed for {node_name}"),
            }));
        }
        Ok(())
    }

    async fn refresh_busy(&self, node_name: &str) -> Result<(), Report<KubernetesError>> {
        let busy: BTreeSet<String> = self
            .node_pods(node_name)
            .await?
            .iter()
            .flat_map(|pod| pod.allocation().device_ids().map(str::to_string).collect::<Vec<_>>())
            .collect();
        let busy: Vec<String> = busy.into_iter().collect();
        let busy = &busy;

        retry_on_conflict("GpuNode", node_name, move || async move {
            match self.nodes.get_opt(node_name).await? {
                Some(node) if &node.spec.busy == busy => Ok(node),
                Some(mut node) => {
                    node.spec.busy = busy.clone();
                    self.nodes.replace(node_name, &PostParams::default(), &node).await
                }
                None => {
                    let spec = GpuNodeSpec {
                        busy: busy.clone(),
                        ..Default::default()
                    };
                    self.nodes
                        .create(&PostParams::default(), &GpuNode::new(node_name, spec))
                        .await
                }
            }
        })
        .await?;
        Ok(())
    }

    /// Writes the node health status, skipping the write when the stored
    /// status already matches. Returns whether a write happened.
    pub async fn set_health(
        &self,
        node_name: &str,
        healthy: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, Report<KubernetesError>> {
        retry_on_conflict("GpuNode", node_name, move || async move {
            let Some(node) = self.nodes.get_opt(node_name).await? else {
                return Ok(false);
            };
            let current = node.status.clone().unwrap_or_default();
            if current.is_healthy() == Some(healthy) {
                return Ok(false);
            }

            let status = GpuNodeStatus {
                node: node_name.to_string(),
                health: GpuNodeStatus::health_label(healthy).to_string(),
                message: if healthy {
                    "node lease is being renewed".to_string()
                } else {
                    "node lease expired".to_string()
                },
                last_health_time: if healthy {
                    Some(now)
                } else {
                    current.last_health_time
                },
                last_transition_time: Some(now),
            };
            let patch = serde_json::json!({
                "metadata": { "resourceVersion": node.resource_version() },
                "status": status,
            });
            self.nodes
                .patch_status(node_name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(true)
        })
        .await
        .inspect(|written| {
            if *written {
                info!(node_name, healthy, "node health written");
            }
        })
    }
}
