use std::future::Future;

use error_stack::Report;
use futures::StreamExt;
use kube::runtime::watcher::watcher;
use kube::runtime::watcher::Config;
use kube::runtime::watcher::Event;
use kube::Api;
use kube::Client;
use kube::ResourceExt;
use tokio::select;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::crd::GpuNode;
use super::crd::GpuPod;
use super::KubernetesError;
use crate::config::WATCH_RECONNECT_DELAY;
use crate::domain::index::ResourceIndex;

/// Mirrors `GpuNode` and `GpuPod` records into the resource index.
///
/// Every read served in crd mode comes out of the index, so this is the
/// only path from the API server to the scheduler.
pub struct CrdMirror {
    client: Client,
    index: ResourceIndex,
    nodes_synced: watch::Sender<bool>,
}

impl CrdMirror {
    pub fn new(client: Client, index: ResourceIndex) -> Self {
        let (nodes_synced, _) = watch::channel(false);
        Self {
            client,
            index,
            nodes_synced,
        }
    }

    /// Turns `true` once the first full node list reached the index.
    pub fn nodes_synced(&self) -> watch::Receiver<bool> {
        self.nodes_synced.subscribe()
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(self, cancellation_token: CancellationToken) {
        info!("Starting CRD mirror");
        tokio::join!(
            supervise("GpuNode", &cancellation_token, || self.watch_nodes()),
            supervise("GpuPod", &cancellation_token, || self.watch_pods()),
        );
        info!("CRD mirror stopped");
    }

    async fn watch_nodes(&self) -> Result<(), Report<KubernetesError>> {
        let api: Api<GpuNode> = Api::all(self.client.clone());
        let mut stream = watcher(api, Config::default()).boxed();

        while let Some(event) = stream.next().await {
            let event = event.map_err(|e| KubernetesError::WatchFailed {
                message: format!("GpuNode watch stream error: {e}"),
            })?;
            let applied = match event {
                Event::Applied(node) => {
                    debug!(node_name = %node.name_any(), "GpuNode applied");
                    self.index.sync_node(node.record()).await
                }
                Event::Deleted(node) => {
                    debug!(node_name = %node.name_any(), "GpuNode deleted");
                    self.index.remove_node(node.name_any()).await
                }
                Event::Restarted(nodes) => {
                    info!(count = nodes.len(), "GpuNode list synced");
                    let result = self
                        .index
                        .replace_nodes(nodes.iter().map(GpuNode::record).collect())
                        .await;
                    if result.is_ok() {
                        self.nodes_synced.send_replace(true);
                    }
                    result
                }
            };
            applied.map_err(|e| e.change_context(KubernetesError::WatchFailed {
                message: "resource index stopped".to_string(),
            }))?;
        }
        Ok(())
    }

    async fn watch_pods(&self) -> Result<(), Report<KubernetesError>> {
        let api: Api<GpuPod> = Api::all(self.client.clone());
        let mut stream = watcher(api, Config::default()).boxed();

        while let Some(event) = stream.next().await {
            let event = event.map_err(|e| KubernetesError::WatchFailed {
                message: format!("GpuPod watch stream error: {e}"),
            })?;
            let applied = match event {
                Event::Applied(pod) => self.index.upsert_pod(pod.allocation()).await,
                Event::Deleted(pod) => self.index.remove_pod(pod.allocation().key()).await,
                Event::Restarted(pods) => {
                    info!(count = pods.len(), "GpuPod list synced");
                    self.index
                        .replace_pods(pods.iter().map(GpuPod::allocation).collect())
                        .await
                }
            };
            applied.map_err(|e| e.change_context(KubernetesError::WatchFailed {
                message: "resource index stopped".to_string(),
            }))?;
        }
        Ok(())
    }
}

/// Keeps one watch alive until cancellation, restarting it when the stream
/// ends or fails.
pub(crate) async fn supervise<F, Fut>(what: &str, cancellation_token: &CancellationToken, mut watch: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), Report<KubernetesError>>>,
{
    loop {
        select! {
            _ = cancellation_token.cancelled() => {
                info!(what, "watch shutdown requested");
                break;
            }
            result = watch() => {
                match result {
                    Ok(()) => {
                        warn!(what, "watch stream ended unexpectedly, restarting...");
                    }
                    Err(e) => {
                        error!(what, "watch failed: {e:?}");
                        select! {
                            _ = cancellation_token.cancelled() => break,
                            _ = tokio::time::sleep(WATCH_RECONNECT_DELAY) => {}
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use similar_asserts::assert_eq;

    use super::*;

    #[tokio::test]
    async fn supervise_restarts_failed_watch_until_cancelled() {
        let token = CancellationToken::new();
        let attempts = &AtomicU32::new(0);
        let stopper = token.clone();

        supervise("test", &token, move || {
            let stopper = stopper.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 1 {
                    stopper.cancel();
                    std::future::pending::<()>().await;
                }
                Err(Report::new(KubernetesError::WatchFailed {
                    message: "boom".to_string(),
                }))
            }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 2, "should restart once then stop");
    }

    #[tokio::test]
    async fn supervise_returns_immediately_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();

        tokio::time::timeout(
            Duration::from_secs(1),
            supervise("test", &token, || std::future::pending()),
        )
        .await
        .expect("cancelled supervisor should return");
    }
}
