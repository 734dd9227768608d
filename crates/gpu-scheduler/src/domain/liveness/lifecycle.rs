use std::collections::HashMap;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;

#[derive(Debug, Clone)]
struct ProbeRecord {
    renew_time: Option<DateTime<Utc>>,
    probe_at: DateTime<Utc>,
}

/// Lease based liveness evaluation.
///
/// A node stays healthy as long as its lease renew time kept advancing
/// within the grace period. The local observation time is used instead of
/// the renew time itself so clock skew between nodes does not matter.
#[derive(Debug)]
pub struct NodeLifecycle {
    grace: chrono::Duration,
    probes: HashMap<String, ProbeRecord>,
}

impl NodeLifecycle {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace: chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX),
            probes: HashMap::new(),
        }
    }

    /// Records the renew time currently stored in the node's lease.
    pub fn observe(&mut self, node_name: &str, renew_time: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        match self.probes.get_mut(node_name) {
            Some(record) => {
                if renew_time > record.renew_time {
                    record.renew_time = renew_time;
                    record.probe_at = now;
                }
            }
            None => {
                self.probes.insert(
                    node_name.to_string(),
                    ProbeRecord {
                        renew_time,
                        probe_at: now,
                    },
                );
            }
        }
    }

    /// Returns the health to write for `node_name` when it differs from
    /// `current`, or `None` when nothing has to change.
    pub fn evaluate(
        &self,
        node_name: &str,
        current: Option<bool>,
        now: DateTime<Utc>,
    ) -> Option<bool> {
        let record = self.probes.get(node_name)?;
        let healthy = now.signed_duration_since(record.probe_at) <= self.grace;
        (current != Some(healthy)).then_some(healthy)
    }

    /// Drops the records of nodes that no longer exist.
    pub fn retain<'a>(&mut self, nodes: impl IntoIterator<Item = &'a str>) {
        let keep: std::collections::HashSet<&str> = nodes.into_iter().collect();
        self.probes.retain(|name, _| keep.contains(name.as_str()));
    }

    pub fn last_probe(&self, node_name: &str) -> Option<DateTime<Utc>> {
        self.probes.get(node_name).map(|r| r.probe_at)
    }
}
