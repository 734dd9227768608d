use std::collections::BTreeMap;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;

use api_types::ExtenderArgs;
use api_types::ExtenderFilterResult;
use api_types::ExtenderPreemptionArgs;
use api_types::ExtenderPreemptionResult;
use api_types::HostPriority;
use k8s_openapi::api::core::v1::Pod;
use tracing::info;
use tracing::warn;
use utils::logging::SIDE_LOG_TARGET;

use super::parallelize_until;
use super::pod_ref;
use super::FilterVerdict;
use super::Framework;
use crate::config::DEFAULT_PARALLELISM;
use crate::domain::index::ClusterSnapshot;
use crate::domain::index::ResourceIndex;

/// Answers the scheduler's extender calls from a snapshot of the index.
pub struct SchedulerService {
    framework: Arc<Framework>,
    index: ResourceIndex,
    parallelism: usize,
}

struct FilterOutcome {
    accepted: Vec<String>,
    failed: BTreeMap<String, String>,
}

impl SchedulerService {
    pub fn new(framework: Framework, index: ResourceIndex, parallelism: usize) -> Self {
        Self {
            framework: Arc::new(framework),
            index,
            parallelism: if parallelism == 0 {
                DEFAULT_PARALLELISM
            } else {
                parallelism
            },
        }
    }

    async fn snapshot(&self) -> Result<Arc<ClusterSnapshot>, String> {
        self.index
            .snapshot()
            .await
            .map(Arc::new)
            .map_err(|e| format!("{e}"))
    }

    async fn run_filter(
        &self,
        pod: Arc<Pod>,
        node_names: Vec<String>,
        snapshot: Arc<ClusterSnapshot>,
    ) -> FilterOutcome {
        let pieces = node_names.len();
        let node_names = Arc::new(node_names);
        // accepted names land in the next free slot, reasons in the node's own slot
        let accepted: Arc<Vec<OnceLock<String>>> = Arc::new((0..pieces).map(|_| OnceLock::new()).collect());
        let reasons: Arc<Vec<OnceLock<String>>> = Arc::new((0..pieces).map(|_| OnceLock::new()).collect());
        let count = Arc::new(AtomicUsize::new(0));

        {
            let framework = self.framework.clone();
            let node_names = node_names.clone();
            let accepted = accepted.clone();
            let reasons = reasons.clone();
            let count = count.clone();
            let pod = pod.clone();
            parallelize_until(self.parallelism, pieces, move |i| {
                let node_name = &node_names[i];
                match framework.run_filter_plugins(&pod, node_name, &snapshot) {
                    FilterVerdict::Accept => {
                        let slot = count.fetch_add(1, Ordering::SeqCst);
                        let _ = accepted[slot].set(node_name.clone());
                    }
                    FilterVerdict::Reject(reason) => {
                        let _ = reasons[i].set(reason);
                    }
                }
            })
            .await;
        }

        let accepted_count = count.load(Ordering::SeqCst);
        let accepted: Vec<String> = accepted
            .iter()
            .take(accepted_count)
            .filter_map(|slot| slot.get().cloned())
            .collect();
        let failed = node_names
            .iter()
            .zip(reasons.iter())
            .filter_map(|(name, reason)| Some((name.clone(), reason.get()?.clone())))
            .collect();

        FilterOutcome { accepted, failed }
    }

    /// Keeps the candidate nodes every filter plugin accepts.
    pub async fn filter(&self, args: ExtenderArgs) -> ExtenderFilterResult {
        let pod = Arc::new(args.pod);
        let node_names = args.node_names.unwrap_or_default();
        let pod_name = pod_ref(&pod);

        let snapshot = match self.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(pod = %pod_name, "filter without index: {error}");
                return ExtenderFilterResult {
                    node_names: Some(Vec::new()),
                    failed_nodes: node_names
                        .into_iter()
                        .map(|n| (n, error.clone()))
                        .collect(),
                    error,
                };
            }
        };

        let outcome = self.run_filter(pod, node_names, snapshot).await;
        for (node_name, reason) in &outcome.failed {
            info!(target: SIDE_LOG_TARGET, pod = %pod_name, node_name = %node_name, verdict = "reject", reason = %reason);
        }
        for node_name in &outcome.accepted {
            info!(target: SIDE_LOG_TARGET, pod = %pod_name, node_name = %node_name, verdict = "accept");
        }
        info!(
            pod = %pod_name,
            accepted = outcome.accepted.len(),
            rejected = outcome.failed.len(),
            "filter done"
        );

        ExtenderFilterResult {
            node_names: Some(outcome.accepted),
            failed_nodes: outcome.failed,
            error: String::new(),
        }
    }

    /// Scores every candidate node, highest score first.
    pub async fn prioritize(&self, args: ExtenderArgs) -> Vec<HostPriority> {
        let node_names = args.node_names.unwrap_or_default();
        let pod = Arc::new(args.pod);
        let pod_name = pod_ref(&pod);

        let snapshot = match self.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(pod = %pod_name, "prioritize without index: {error}");
                Arc::new(ClusterSnapshot::default())
            }
        };

        let pieces = node_names.len();
        let node_names = Arc::new(node_names);
        let scores: Arc<Vec<AtomicI64>> = Arc::new((0..pieces).map(|_| AtomicI64::new(0)).collect());
        {
            let framework = self.framework.clone();
            let node_names = node_names.clone();
            let scores = scores.clone();
            parallelize_until(self.parallelism, pieces, move |i| {
                let score = framework.run_score_plugins(&pod, &node_names[i], &snapshot);
                scores[i].store(score, Ordering::SeqCst);
            })
            .await;
        }

        let mut priorities: Vec<HostPriority> = node_names
            .iter()
            .zip(scores.iter())
            .map(|(host, score)| HostPriority {
                host: host.clone(),
                score: score.load(Ordering::SeqCst),
            })
            .collect();
        // stable: equal scores keep the caller's order
        priorities.sort_by(|a, b| b.score.cmp(&a.score));

        for priority in &priorities {
            info!(
                target: SIDE_LOG_TARGET,
                pod = %pod_name,
                node_name = %priority.host,
                verdict = "score",
                score = priority.score
            );
        }
        priorities
    }

    /// Drops the victim nodes on which the pod would still not fit.
    pub async fn preempt(&self, args: ExtenderPreemptionArgs) -> ExtenderPreemptionResult {
        let mut victims = args.node_name_to_meta_victims;
        let node_names: Vec<String> = victims.keys().cloned().collect();

        let result = self
            .filter(ExtenderArgs {
                pod: args.pod,
                node_names: Some(node_names),
            })
            .await;

        let feasible = result.node_names.unwrap_or_default();
        victims.retain(|node_name, _| feasible.contains(node_name));
        ExtenderPreemptionResult {
            node_name_to_meta_victims: victims,
        }
    }
}
