use std::collections::BTreeMap;
use std::collections::BTreeSet;

use api_types::AllocationUpdate;
use api_types::NodeInventory;
use api_types::PodAllocation;
use api_types::PodKey;
use serde::Serialize;

use crate::domain::liveness::NodeHealth;

/// Everything the index knows about one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeView {
    pub name: String,
    pub inventory: Option<NodeInventory>,
    pub health: Option<NodeHealth>,
    /// Devices bound to any pod on this node.
    pub busy: BTreeSet<String>,
}

impl NodeView {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health.as_ref().is_some_and(|h| h.healthy)
    }

    /// Devices of `model` not bound to any pod. `model` must be normalized.
    pub fn free(&self, model: &str) -> BTreeSet<String> {
        self.inventory
            .as_ref()
            .and_then(|inv| inv.models.get(model))
            .map(|devices| devices.difference(&self.busy).cloned().collect())
            .unwrap_or_default()
    }
}

/// Node record as persisted in the external store.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub name: String,
    pub inventory: Option<NodeInventory>,
    pub health: Option<NodeHealth>,
}

/// Consistent copy of the whole index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterSnapshot {
    pub nodes: BTreeMap<String, NodeView>,
    pub pods: BTreeMap<PodKey, PodAllocation>,
}

impl ClusterSnapshot {
    pub fn node(&self, name: &str) -> Option<&NodeView> {
        self.nodes.get(name)
    }
}

/// A change fanned out to watchers.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexEvent {
    NodeSynced(NodeView),
    NodeDeleted(NodeView),
    PodSynced(PodAllocation),
    PodDeleted(PodAllocation),
}

/// Composite state owned by the index actor.
#[derive(Debug, Default)]
pub struct IndexState {
    nodes: BTreeMap<String, NodeView>,
    pods: BTreeMap<PodKey, PodAllocation>,
}

impl IndexState {
    pub fn apply_inventory(&mut self, inventory: NodeInventory) -> Vec<IndexEvent> {
        let node = self.node_mut(&inventory.node_name);
        if node.inventory.as_ref() == Some(&inventory) {
            return Vec::new();
        }
        node.inventory = Some(inventory);
        vec![IndexEvent::NodeSynced(node.clone())]
    }

    pub fn set_health(&mut self, health: NodeHealth) -> Vec<IndexEvent> {
        let node = self.node_mut(&health.node_name);
        if node.health.as_ref() == Some(&health) {
            return Vec::new();
        }
        node.health = Some(health);
        vec![IndexEvent::NodeSynced(node.clone())]
    }

    /// Applies a batch pushed by the agent of `update.node_name`.
    pub fn apply_allocations(&mut self, update: AllocationUpdate) -> Vec<IndexEvent> {
        let node_name = update.node_name;
        let mut events = Vec::new();
        let mut touched = BTreeSet::from([node_name.clone()]);

        if update.full_sync {
            let listed: BTreeSet<PodKey> = update.sync.iter().map(|a| a.key()).collect();
            let stale: Vec<PodKey> = self
                .pods
                .iter()
                .filter(|(key, a)| a.node_name == node_name && !listed.contains(*key))
                .map(|(key, _)| key.clone())
                .collect();
            for key in stale {
                events.extend(self.take_pod(&key, &mut touched));
            }
        }

        for key in &update.delete {
            events.extend(self.take_pod(key, &mut touched));
        }

        for mut allocation in update.sync {
            if allocation.node_name.is_empty() {
                allocation.node_name = node_name.clone();
            }
            events.extend(self.put_pod(allocation, &mut touched));
        }

        events.extend(self.recompute_busy(touched));
        events
    }

    pub fn sync_node(&mut self, record: NodeRecord) -> Vec<IndexEvent> {
        let node = self.node_mut(&record.name);
        if node.inventory == record.inventory && node.health == record.health {
            return Vec::new();
        }
        node.inventory = record.inventory;
        node.health = record.health;
        vec![IndexEvent::NodeSynced(node.clone())]
    }

    pub fn remove_node(&mut self, name: &str) -> Vec<IndexEvent> {
        self.nodes
            .remove(name)
            .map(IndexEvent::NodeDeleted)
            .into_iter()
            .collect()
    }

    /// Replaces the whole node set, as after a watch restart.
    pub fn replace_nodes(&mut self, records: Vec<NodeRecord>) -> Vec<IndexEvent> {
        let keep: BTreeSet<&str> = records.iter().map(|r| r.name.as_str()).collect();
        let gone: Vec<String> = self
            .nodes
            .keys()
            .filter(|name| !keep.contains(name.as_str()))
            .cloned()
            .collect();

        let mut events = Vec::new();
        for name in gone {
            events.extend(self.remove_node(&name));
        }
        for record in records {
            events.extend(self.sync_node(record));
        }
        events
    }

    pub fn upsert_pod(&mut self, allocation: PodAllocation) -> Vec<IndexEvent> {
        let mut touched = BTreeSet::new();
        let mut events: Vec<IndexEvent> = self.put_pod(allocation, &mut touched).into_iter().collect();
        events.extend(self.recompute_busy(touched));
        events
    }

    pub fn remove_pod(&mut self, key: &PodKey) -> Vec<IndexEvent> {
        let mut touched = BTreeSet::new();
        let mut events: Vec<IndexEvent> = self.take_pod(key, &mut touched).into_iter().collect();
        events.extend(self.recompute_busy(touched));
        events
    }

    /// Replaces the whole pod set, as after a watch restart.
    pub fn replace_pods(&mut self, allocations: Vec<PodAllocation>) -> Vec<IndexEvent> {
        let keep: BTreeSet<PodKey> = allocations.iter().map(|a| a.key()).collect();
        let gone: Vec<PodKey> = self
            .pods
            .keys()
            .filter(|key| !keep.contains(*key))
            .cloned()
            .collect();

        let mut touched = BTreeSet::new();
        let mut events = Vec::new();
        for key in gone {
            events.extend(self.take_pod(&key, &mut touched));
        }
        for allocation in allocations {
            events.extend(self.put_pod(allocation, &mut touched));
        }
        events.extend(self.recompute_busy(touched));
        events
    }

    pub fn busy(&self, node_name: &str) -> BTreeSet<String> {
        self.nodes
            .get(node_name)
            .map(|n| n.busy.clone())
            .unwrap_or_default()
    }

    pub fn free(&self, node_name: &str, model: &str) -> BTreeSet<String> {
        self.nodes
            .get(node_name)
            .map(|n| n.free(model))
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            nodes: self.nodes.clone(),
            pods: self.pods.clone(),
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeView> {
        self.nodes.values()
    }

    pub fn pods(&self) -> impl Iterator<Item = &PodAllocation> {
        self.pods.values()
    }

    fn node_mut(&mut self, name: &str) -> &mut NodeView {
        self.nodes
            .entry(name.to_string())
            .or_insert_with(|| NodeView::new(name))
    }

    fn put_pod(
        &mut self,
        allocation: PodAllocation,
        touched: &mut BTreeSet<String>,
    ) -> Option<IndexEvent> {
        let key = allocation.key();
        if self.pods.get(&key) == Some(&allocation) {
            return None;
        }
        touched.insert(allocation.node_name.clone());
        if let Some(previous) = self.pods.insert(key, allocation.clone()) {
            // a pod moved between nodes releases its old devices
            touched.insert(previous.node_name);
        }
        Some(IndexEvent::PodSynced(allocation))
    }

    fn take_pod(&mut self, key: &PodKey, touched: &mut BTreeSet<String>) -> Option<IndexEvent> {
        let removed = self.pods.remove(key)?;
        touched.insert(removed.node_name.clone());
        Some(IndexEvent::PodDeleted(removed))
    }

    fn recompute_busy(&mut self, node_names: BTreeSet<String>) -> Vec<IndexEvent> {
        let mut events = Vec::new();
        for node_name in node_names.into_iter().filter(|n| !n.is_empty()) {
            let busy: BTreeSet<String> = self
                .pods
                .values()
                .filter(|a| a.node_name == node_name)
                .flat_map(|a| a.device_ids().map(str::to_string))
                .collect();

            let node = self.node_mut(&node_name);
            if node.busy != busy {
                node.busy = busy;
                events.push(IndexEvent::NodeSynced(node.clone()));
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use api_types::ContainerDevices;
    use api_types::GpuDevice;
    use chrono::Utc;
    use similar_asserts::assert_eq;

    use super::*;

    fn inventory(node: &str, models: &[(&str, &[&str])]) -> NodeInventory {
        NodeInventory {
            node_name: node.to_string(),
            models: models
                .iter()
                .map(|(m, ids)| (m.to_string(), ids.iter().map(|id| id.to_string()).collect()))
                .collect(),
            ..Default::default()
        }
    }

    fn allocation(node: &str, name: &str, ids: &[&str]) -> PodAllocation {
        PodAllocation {
            namespace: "default".to_string(),
            name: name.to_string(),
            node_name: node.to_string(),
            containers: vec![ContainerDevices {
                name: "main".to_string(),
                devices: ids.iter().map(|id| GpuDevice::unresolved(*id, node)).collect(),
            }],
        }
    }

    fn batch(node: &str, sync: Vec<PodAllocation>, delete: Vec<PodKey>, full: bool) -> AllocationUpdate {
        AllocationUpdate {
            sync,
            delete,
            node_name: node.to_string(),
            full_sync: full,
        }
    }

    fn ids(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn claimed_device_leaves_free_set() {
        let mut state = IndexState::default();
        state.apply_inventory(inventory("n1", &[("a100", &["d1", "d2"])]));
        assert_eq!(state.free("n1", "a100"), ids(&["d1", "d2"]));

        state.apply_allocations(batch("n1", vec![allocation("n1", "p1", &["d1"])], vec![], false));

        assert_eq!(state.free("n1", "a100"), ids(&["d2"]));
        assert_eq!(state.busy("n1"), ids(&["d1"]));
    }

    #[test]
    fn busy_set_is_union_of_node_pods() {
        let mut state = IndexState::default();
        state.apply_inventory(inventory("n1", &[("a100", &["d1", "d2", "d3"])]));

        state.apply_allocations(batch(
            "n1",
            vec![allocation("n1", "p1", &["d1"]), allocation("n1", "p2", &["d2", "d3"])],
            vec![],
            true,
        ));
        state.apply_allocations(batch("n1", vec![], vec![PodKey::new("default", "p2")], false));

        assert_eq!(state.busy("n1"), ids(&["d1"]));
        let free = state.free("n1", "a100");
        assert!(
            free.is_disjoint(&state.busy("n1")),
            "free and busy sets should never overlap"
        );
    }

    #[test]
    fn full_sync_drops_pods_missing_from_the_batch() {
        let mut state = IndexState::default();
        state.apply_allocations(batch(
            "n1",
            vec![allocation("n1", "p1", &["d1"]), allocation("n1", "p2", &["d2"])],
            vec![],
            true,
        ));
        state.apply_allocations(batch("n2", vec![allocation("n2", "p3", &["x1"])], vec![], true));

        let events = state.apply_allocations(batch("n1", vec![], vec![], true));

        assert!(events.contains(&IndexEvent::PodDeleted(allocation("n1", "p1", &["d1"]))));
        assert_eq!(state.busy("n1"), BTreeSet::new());
        assert_eq!(state.busy("n2"), ids(&["x1"]), "other nodes are untouched");
    }

    #[test]
    fn partial_batch_keeps_unlisted_pods() {
        let mut state = IndexState::default();
        state.apply_allocations(batch("n1", vec![allocation("n1", "p1", &["d1"])], vec![], true));

        state.apply_allocations(batch("n1", vec![allocation("n1", "p2", &["d2"])], vec![], false));

        assert_eq!(state.busy("n1"), ids(&["d1", "d2"]));
    }

    #[test]
    fn unchanged_allocation_emits_nothing() {
        let mut state = IndexState::default();
        let update = batch("n1", vec![allocation("n1", "p1", &["d1"])], vec![], true);
        state.apply_allocations(update.clone());

        let events = state.apply_allocations(update);

        assert!(events.is_empty(), "repeated batch should be a no-op");
    }

    #[test]
    fn health_change_emits_node_event() {
        let mut state = IndexState::default();
        let health = NodeHealth::healthy("n1", Utc::now());

        assert_eq!(state.set_health(health.clone()).len(), 1);
        assert!(state.set_health(health).is_empty());
        assert!(state.snapshot().node("n1").unwrap().is_healthy());
    }

    #[test]
    fn replace_nodes_removes_vanished_records() {
        let mut state = IndexState::default();
        state.apply_inventory(inventory("n1", &[]));
        state.apply_inventory(inventory("n2", &[]));

        let events = state.replace_nodes(vec![NodeRecord {
            name: "n2".to_string(),
            inventory: Some(inventory("n2", &[])),
            health: None,
        }]);

        assert!(matches!(&events[0], IndexEvent::NodeDeleted(view) if view.name == "n1"));
        assert_eq!(state.snapshot().nodes.len(), 1);
    }

    #[test]
    fn mirrored_pod_updates_busy_set() {
        let mut state = IndexState::default();
        state.upsert_pod(allocation("n1", "p1", &["d1"]));
        assert_eq!(state.busy("n1"), ids(&["d1"]));

        state.replace_pods(vec![allocation("n1", "p2", &["d2"])]);
        assert_eq!(state.busy("n1"), ids(&["d2"]));

        state.remove_pod(&PodKey::new("default", "p2"));
        assert!(state.busy("n1").is_empty());
    }
}
