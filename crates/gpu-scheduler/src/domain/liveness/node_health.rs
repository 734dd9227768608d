use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use super::NodeHealth;
use crate::domain::index::ResourceIndex;

/// Heartbeat-driven node health, used when agents report to the central
/// service over HTTP.
///
/// Only transitions are forwarded to the resource index.
pub struct NodeHealthTracker {
    ttl: chrono::Duration,
    nodes: RwLock<HashMap<String, NodeHealth>>,
    index: Option<ResourceIndex>,
}

impl NodeHealthTracker {
    pub fn new(ttl: Duration, index: Option<ResourceIndex>) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            nodes: RwLock::new(HashMap::new()),
            index,
        }
    }

    /// Records a heartbeat. Returns the new state when the node just became
    /// healthy.
    pub fn notify(&self, node_name: &str, now: DateTime<Utc>) -> Option<NodeHealth> {
        let Ok(mut nodes) = self.nodes.write() else {
            tracing::error!("node health lock poisoned");
            return None;
        };

        match nodes.get_mut(node_name) {
            Some(health) if health.healthy => {
                health.last_healthy_at = Some(now);
                None
            }
            Some(health) => {
                health.healthy = true;
                health.last_healthy_at = Some(now);
                info!(node_name, "node recovered");
                Some(health.clone())
            }
            None => {
                let health = NodeHealth::healthy(node_name, now);
                nodes.insert(node_name.to_string(), health.clone());
                info!(node_name, "node registered as healthy");
                Some(health)
            }
        }
    }

    /// Flips every node whose last heartbeat is older than the TTL.
    /// Returns only the nodes that changed state.
    pub fn evaluate(&self, now: DateTime<Utc>) -> Vec<NodeHealth> {
        let Ok(mut nodes) = self.nodes.write() else {
            tracing::error!("node health lock poisoned");
            return Vec::new();
        };

        let mut transitions = Vec::new();
        for health in nodes.values_mut().filter(|h| h.healthy) {
            let expired = health
                .last_healthy_at
                .map_or(true, |at| now.signed_duration_since(at) > self.ttl);
            if expired {
                health.healthy = false;
                warn!(
                    node_name = %health.node_name,
                    last_healthy_at = ?health.last_healthy_at,
                    "node missed its heartbeat window"
                );
                transitions.push(health.clone());
            }
        }
        transitions
    }

    pub fn status(&self, node_name: &str) -> Option<NodeHealth> {
        self.nodes.read().ok()?.get(node_name).cloned()
    }

    /// Records a heartbeat received now and forwards a transition.
    pub async fn heartbeat(&self, node_name: &str) {
        if let Some(transition) = self.notify(node_name, Utc::now()) {
            self.forward(transition).await;
        }
    }

    async fn forward(&self, health: NodeHealth) {
        let Some(index) = &self.index else {
            return;
        };
        if let Err(e) = index.set_health(health).await {
            warn!("failed to forward node health: {e:?}");
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(self: Arc<Self>, interval: Duration, cancellation_token: CancellationToken) {
        info!("Starting node health tracker");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Node health tracker shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    for transition in self.evaluate(Utc::now()) {
                        self.forward(transition).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn tracker() -> NodeHealthTracker {
        NodeHealthTracker::new(Duration::from_secs(6), None)
    }

    #[test]
    fn first_heartbeat_is_a_transition() {
        let tracker = tracker();
        let now = Utc::now();

        let transition = tracker.notify("n1", now).expect("new node should transition");

        assert_eq!(transition, NodeHealth::healthy("n1", now));
        assert!(
            tracker.notify("n1", now).is_none(),
            "repeated heartbeat should not transition"
        );
    }

    #[test]
    fn node_flips_unhealthy_exactly_once_after_ttl() {
        let tracker = tracker();
        let t0 = Utc::now();
        tracker.notify("n1", t0);

        assert!(tracker.evaluate(t0 + chrono::Duration::seconds(5)).is_empty());

        let transitions = tracker.evaluate(t0 + chrono::Duration::seconds(7));
        assert_eq!(transitions.len(), 1);
        assert!(!transitions[0].healthy);

        assert!(
            tracker.evaluate(t0 + chrono::Duration::seconds(8)).is_empty(),
            "unhealthy node should not be reported again"
        );
    }

    #[test]
    fn heartbeat_after_expiry_recovers_node() {
        let tracker = tracker();
        let t0 = Utc::now();
        tracker.notify("n1", t0);
        tracker.evaluate(t0 + chrono::Duration::seconds(10));

        let recovered = tracker
            .notify("n1", t0 + chrono::Duration::seconds(11))
            .expect("recovery should transition");

        assert!(recovered.healthy);
        assert_eq!(tracker.status("n1"), Some(recovered));
    }
}
