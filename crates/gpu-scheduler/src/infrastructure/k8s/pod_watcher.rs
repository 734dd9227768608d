use api_types::PodKey;
use error_stack::Report;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::watcher;
use kube::runtime::watcher::Config;
use kube::runtime::watcher::Event;
use kube::Api;
use kube::Client;
use kube::ResourceExt;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::KubernetesError;
use crate::config::GPU_RESOURCE_NAME;
use crate::config::WATCH_RECONNECT_DELAY;
use crate::domain::allocation::is_running;
use crate::domain::allocation::requests_devices;

/// What a pod event means for the relister.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodSignal {
    Relist,
    Remove(PodKey),
    Ignore,
}

/// Classifies one watch event of a pod on this node.
pub fn classify(event: &Event<Pod>) -> PodSignal {
    match event {
        Event::Applied(pod) if is_running(pod) && requests_devices(pod, GPU_RESOURCE_NAME) => {
            PodSignal::Relist
        }
        Event::Deleted(pod) if requests_devices(pod, GPU_RESOURCE_NAME) => PodSignal::Remove(
            PodKey::new(pod.namespace().unwrap_or_default(), pod.name_any()),
        ),
        // the list may hide deletions missed while disconnected
        Event::Restarted(_) => PodSignal::Relist,
        _ => PodSignal::Ignore,
    }
}

/// Watches the pods bound to this node and turns their lifecycle into
/// relist signals and immediate removals.
pub struct PodWatcher {
    client: Client,
    node_name: String,
}

impl PodWatcher {
    pub fn new(client: Client, node_name: String) -> Self {
        Self { client, node_name }
    }

    #[tracing::instrument(skip_all, fields(node_name = %self.node_name))]
    pub async fn run(
        self,
        relist: mpsc::Sender<()>,
        removals: mpsc::Sender<PodKey>,
        cancellation_token: CancellationToken,
    ) {
        info!("Starting pod watcher");
        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Pod watcher shutdown requested");
                    break;
                }
                result = self.watch_pods(&relist, &removals) => {
                    match result {
                        Ok(()) => warn!("Pod watch stream ended unexpectedly, restarting..."),
                        Err(e) => error!("Pod watch failed: {e:?}"),
                    }
                    select! {
                        _ = cancellation_token.cancelled() => break,
                        _ = tokio::time::sleep(WATCH_RECONNECT_DELAY) => {}
                    }
                    // pods may have come and gone while disconnected
                    let _ = relist.try_send(());
                }
            }
        }
    }

    async fn watch_pods(
        &self,
        relist: &mpsc::Sender<()>,
        removals: &mpsc::Sender<PodKey>,
    ) -> Result<(), Report<KubernetesError>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let config = Config::default().fields(&format!("spec.nodeName={}", self.node_name));
        let mut stream = watcher(api, config).boxed();

        while let Some(event) = stream.next().await {
            let event = event.map_err(|e| KubernetesError::WatchFailed {
                message: format!("Watch stream error: {e}"),
            })?;
            match classify(&event) {
                PodSignal::Relist => {
                    // a pending signal already covers this one
                    let _ = relist.try_send(());
                }
                PodSignal::Remove(key) => {
                    debug!(pod = %key, "pod with devices deleted");
                    if removals.send(key).await.is_err() {
                        return Ok(());
                    }
                }
                PodSignal::Ignore => {}
            }
        }
        Ok(())
    }
}
