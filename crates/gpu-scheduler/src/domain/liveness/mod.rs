//! Node liveness tracking.
//!
//! The agent side races health probes against the central service
//! ([`HealthChecker`]). The central side tracks heartbeats
//! ([`NodeHealthTracker`]) or lease renewals ([`NodeLifecycle`]) and flips a
//! node to unhealthy once no fresh signal arrived within the grace window.

pub(crate) mod heartbeat;
mod lifecycle;
mod node_health;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

pub use heartbeat::HealthChecker;
pub use heartbeat::HealthProbe;
pub use heartbeat::ProbeError;
pub use lifecycle::NodeLifecycle;
pub use node_health::NodeHealthTracker;

/// Health of one node as seen by the central service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHealth {
    pub node_name: String,
    pub healthy: bool,
    pub last_healthy_at: Option<DateTime<Utc>>,
}

impl NodeHealth {
    pub fn healthy(node_name: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            node_name: node_name.into(),
            healthy: true,
            last_healthy_at: Some(at),
        }
    }
}
