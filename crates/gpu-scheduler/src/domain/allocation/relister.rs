use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use api_types::AllocationUpdate;
use api_types::NodeInventory;
use api_types::PodAllocation;
use api_types::PodKey;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::diff_allocations;
use super::filter_allocations;
use super::push_with_retry;
use super::AllocationPublisher;
use super::RetryPolicy;
use crate::config::GPU_RESOURCE_NAME;
use crate::config::LIST_TIMEOUT;
use crate::domain::inventory::DeviceCache;
use crate::domain::liveness::HealthChecker;
use crate::infrastructure::pod_resources::PodResourcesSource;

/// Inputs of the relist loop.
pub struct RelisterChannels {
    /// "Relist soon" signals from the pod watcher.
    pub relist: mpsc::Receiver<()>,
    /// Pods observed deleted by the pod watcher.
    pub removals: mpsc::Receiver<PodKey>,
    /// Model-set changes from the inventory scanner.
    pub inventory: mpsc::Receiver<NodeInventory>,
}

/// Node agent control loop keeping the central service in sync with the
/// kubelet's device assignments.
pub struct AllocationRelister {
    cache: Arc<DeviceCache>,
    source: Arc<dyn PodResourcesSource>,
    publisher: Arc<dyn AllocationPublisher>,
    health: HealthChecker,
    health_interval: Duration,
    relist_interval: Duration,
    list_timeout: Duration,
    retry: RetryPolicy,
    last: BTreeMap<PodKey, PodAllocation>,
    last_inventory: Option<NodeInventory>,
}

impl AllocationRelister {
    pub fn new(
        cache: Arc<DeviceCache>,
        source: Arc<dyn PodResourcesSource>,
        publisher: Arc<dyn AllocationPublisher>,
        health: HealthChecker,
        health_interval: Duration,
        relist_interval: Duration,
    ) -> Self {
        Self {
            cache,
            source,
            publisher,
            health,
            health_interval,
            relist_interval,
            list_timeout: LIST_TIMEOUT,
            retry: RetryPolicy::default(),
            last: BTreeMap::new(),
            last_inventory: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn node_name(&self) -> &str {
        self.cache.node_name()
    }

    /// One relist round. A failed or timed out listing skips the round.
    pub async fn relist(&mut self, cancellation_token: &CancellationToken) {
        let pods = match tokio::time::timeout(self.list_timeout, self.source.list()).await {
            Ok(Ok(pods)) => pods,
            Ok(Err(e)) => {
                warn!("failed to list pod resources: {e:?}");
                return;
            }
            Err(_) => {
                warn!(timeout = ?self.list_timeout, "listing pod resources timed out");
                return;
            }
        };

        let current = filter_allocations(pods, &self.cache, GPU_RESOURCE_NAME);
        let diff = diff_allocations(self.node_name(), current, &self.last);
        if !diff.changed {
            debug!("pod allocations unchanged");
            return;
        }

        info!(
            sync = diff.update.sync.len(),
            delete = diff.update.delete.len(),
            "pushing pod allocations"
        );
        match push_with_retry(
            self.publisher.as_ref(),
            &diff.update,
            self.retry,
            cancellation_token,
        )
        .await
        {
            // keep the old snapshot on failure so the next round pushes again
            Ok(()) => self.last = diff.snapshot,
            Err(e) => warn!("dropping allocation batch: {e:?}"),
        }
    }

    /// Pushes the removal of one pod seen deleted by the pod watcher.
    async fn remove(&mut self, key: PodKey, cancellation_token: &CancellationToken) {
        self.last.remove(&key);
        info!(pod = %key, "pushing pod removal");
        let update = AllocationUpdate::removal(self.node_name(), key);
        if let Err(e) =
            push_with_retry(self.publisher.as_ref(), &update, self.retry, cancellation_token).await
        {
            warn!("dropping pod removal: {e:?}");
        }
    }

    async fn publish_inventory(&mut self, mut inventory: NodeInventory) {
        inventory.report_time = Some(Utc::now());
        if let Err(e) = self.publisher.publish_inventory(&inventory).await {
            // the next model change or recovery resends it
            warn!("failed to publish inventory: {e:?}");
        }
        self.last_inventory = Some(inventory);
    }

    /// Forces a full resync after the central service came back.
    async fn resync(&mut self, cancellation_token: &CancellationToken) {
        self.last.clear();
        if let Some(inventory) = self.last_inventory.take() {
            self.publish_inventory(inventory).await;
        }
        self.relist(cancellation_token).await;
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(mut self, mut channels: RelisterChannels, cancellation_token: CancellationToken) {
        info!(node_name = %self.node_name(), "Starting allocation relister");

        if !self.health.check_health_block(&cancellation_token).await {
            return;
        }
        let mut unhealthy = self
            .health
            .check_health(self.health_interval, cancellation_token.child_token());
        self.relist(&cancellation_token).await;

        let mut fallback = tokio::time::interval(self.relist_interval);
        fallback.set_missed_tick_behavior(MissedTickBehavior::Delay);
        fallback.tick().await;

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Allocation relister shutdown requested");
                    break;
                }
                _ = &mut unhealthy => {
                    warn!("central service unhealthy, waiting for it to recover");
                    if !self.health.check_health_block(&cancellation_token).await {
                        break;
                    }
                    unhealthy = self
                        .health
                        .check_health(self.health_interval, cancellation_token.child_token());
                    self.resync(&cancellation_token).await;
                }
                Some(inventory) = channels.inventory.recv() => {
                    self.publish_inventory(inventory).await;
                }
                Some(key) = channels.removals.recv() => {
                    self.remove(key, &cancellation_token).await;
                }
                Some(()) = channels.relist.recv() => {
                    // coalesce signals queued while we were busy
                    while channels.relist.try_recv().is_ok() {}
                    self.relist(&cancellation_token).await;
                }
                _ = fallback.tick() => {
                    self.relist(&cancellation_token).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use error_stack::Report;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::domain::allocation::publisher::tests::RecordingPublisher;
    use crate::domain::inventory::cache::tests::FakeDevices;
    use crate::domain::liveness::heartbeat::tests::ScriptedProbe;
    use crate::infrastructure::k8s::KubernetesError;
    use crate::infrastructure::pod_resources::ContainerDevices;
    use crate::infrastructure::pod_resources::ContainerResources;
    use crate::infrastructure::pod_resources::PodResources;

    #[derive(Default)]
    struct FakeKubelet {
        pods: Mutex<Vec<PodResources>>,
        fail: Mutex<bool>,
    }

    impl FakeKubelet {
        fn set(&self, pods: &[(&str, &[&str])]) {
            *self.pods.lock().unwrap() = pods
                .iter()
                .map(|(name, ids)| PodResources {
                    name: name.to_string(),
                    namespace: "default".to_string(),
                    containers: vec![ContainerResources {
                        name: "main".to_string(),
                        devices: vec![ContainerDevices {
                            resource_name: "nvidia.com/gpu".to_string(),
                            device_ids: ids.iter().map(|id| id.to_string()).collect(),
                        }],
                    }],
                })
                .collect();
        }
    }

    #[async_trait]
    impl PodResourcesSource for FakeKubelet {
        async fn list(&self) -> Result<Vec<PodResources>, Report<KubernetesError>> {
            if *self.fail.lock().unwrap() {
                return Err(Report::new(KubernetesError::ConnectionFailed {
                    message: "socket missing".to_string(),
                }));
            }
            Ok(self.pods.lock().unwrap().clone())
        }
    }

    fn relister(
        kubelet: Arc<FakeKubelet>,
        publisher: Arc<RecordingPublisher>,
    ) -> AllocationRelister {
        let devices = Arc::new(FakeDevices::with(&[("GPU-1", "A100"), ("GPU-2", "A100")]));
        let cache = Arc::new(DeviceCache::new("n1", Duration::from_secs(60), devices));
        let health = HealthChecker::new(
            Arc::new(ScriptedProbe::new(&[], true)),
            Duration::from_millis(50),
            1,
            Duration::from_millis(5),
        );
        AllocationRelister::new(
            cache,
            kubelet,
            publisher,
            health,
            Duration::from_secs(60),
            Duration::from_secs(60),
        )
        .with_retry_policy(RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        })
    }

    #[test_log::test(tokio::test)]
    async fn relist_pushes_only_changes() {
        let kubelet = Arc::new(FakeKubelet::default());
        kubelet.set(&[("p1", &["GPU-1"])]);
        let publisher = Arc::new(RecordingPublisher::default());
        let mut relister = relister(kubelet.clone(), publisher.clone());
        let token = CancellationToken::new();

        relister.relist(&token).await;
        relister.relist(&token).await;

        let updates = publisher.updates();
        assert_eq!(updates.len(), 1, "unchanged round should not push");
        assert_eq!(updates[0].sync[0].containers[0].devices[0].model, "A100");
    }

    #[test_log::test(tokio::test)]
    async fn failed_listing_skips_round() {
        let kubelet = Arc::new(FakeKubelet::default());
        *kubelet.fail.lock().unwrap() = true;
        let publisher = Arc::new(RecordingPublisher::default());
        let mut relister = relister(kubelet, publisher.clone());

        relister.relist(&CancellationToken::new()).await;

        assert!(publisher.updates().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn failed_push_is_retried_on_next_round() {
        let kubelet = Arc::new(FakeKubelet::default());
        kubelet.set(&[("p1", &["GPU-1"])]);
        let publisher = Arc::new(RecordingPublisher::failing(vec![None, None]));
        let mut relister = relister(kubelet, publisher.clone());
        let token = CancellationToken::new();

        relister.relist(&token).await;
        relister.relist(&token).await;

        assert_eq!(
            publisher.updates().len(),
            3,
            "two failed attempts then one successful resend"
        );
    }

    #[test_log::test(tokio::test)]
    async fn removal_is_not_repeated_by_next_relist() {
        let kubelet = Arc::new(FakeKubelet::default());
        kubelet.set(&[("p1", &["GPU-1"]), ("p2", &["GPU-2"])]);
        let publisher = Arc::new(RecordingPublisher::default());
        let mut relister = relister(kubelet.clone(), publisher.clone());
        let token = CancellationToken::new();
        relister.relist(&token).await;

        relister.remove(PodKey::new("default", "p2"), &token).await;
        kubelet.set(&[("p1", &["GPU-1"])]);
        relister.relist(&token).await;

        let updates = publisher.updates();
        assert_eq!(updates.len(), 2, "relist after removal should be a no-op");
        assert_eq!(updates[1].delete, vec![PodKey::new("default", "p2")]);
        assert!(!updates[1].full_sync);
    }

    #[test_log::test(tokio::test)]
    async fn resync_republishes_inventory_and_forces_push() {
        let kubelet = Arc::new(FakeKubelet::default());
        kubelet.set(&[("p1", &["GPU-1"])]);
        let publisher = Arc::new(RecordingPublisher::default());
        let mut relister = relister(kubelet, publisher.clone());
        let token = CancellationToken::new();
        relister
            .publish_inventory(NodeInventory {
                node_name: "n1".to_string(),
                ..Default::default()
            })
            .await;
        relister.relist(&token).await;

        relister.resync(&token).await;

        assert_eq!(publisher.inventories.lock().unwrap().len(), 2);
        assert_eq!(
            publisher.updates().len(),
            2,
            "resync should push even though nothing changed"
        );
    }

    #[test_log::test(tokio::test)]
    async fn run_relists_on_signal_until_cancelled() {
        let kubelet = Arc::new(FakeKubelet::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let relister = relister(kubelet.clone(), publisher.clone());
        let (relist_tx, relist_rx) = mpsc::channel(10);
        let (_removal_tx, removal_rx) = mpsc::channel(10);
        let (_inventory_tx, inventory_rx) = mpsc::channel(10);
        let token = CancellationToken::new();

        let handle = tokio::spawn(relister.run(
            RelisterChannels {
                relist: relist_rx,
                removals: removal_rx,
                inventory: inventory_rx,
            },
            token.clone(),
        ));

        // initial round pushes the empty listing
        tokio::time::sleep(Duration::from_millis(50)).await;
        kubelet.set(&[("p1", &["GPU-1"])]);
        relist_tx.send(()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        handle.await.unwrap();

        let updates = publisher.updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].sync.len(), 1);
    }
}
