use std::collections::BTreeMap;

use api_types::AllocationUpdate;
use api_types::ContainerDevices;
use api_types::PodAllocation;
use api_types::PodKey;

use crate::domain::inventory::DeviceCache;
use crate::infrastructure::pod_resources::PodResources;

/// Keeps the containers holding at least one `resource` device and resolves
/// their device ids. Pods left without such a container are dropped.
pub fn filter_allocations(
    pods: Vec<PodResources>,
    cache: &DeviceCache,
    resource: &str,
) -> Vec<PodAllocation> {
    pods.into_iter()
        .filter_map(|pod| {
            let containers: Vec<ContainerDevices> = pod
                .containers
                .into_iter()
                .filter_map(|container| {
                    let devices: Vec<_> = container
                        .devices
                        .iter()
                        .filter(|group| group.resource_name == resource)
                        .flat_map(|group| group.device_ids.iter())
                        .map(|id| cache.resolve_lossy(id))
                        .collect();
                    (!devices.is_empty()).then(|| ContainerDevices {
                        name: container.name,
                        devices,
                    })
                })
                .collect();

            (!containers.is_empty()).then(|| PodAllocation {
                namespace: pod.namespace,
                name: pod.name,
                node_name: cache.node_name().to_string(),
                containers,
            })
        })
        .collect()
}

/// Outcome of one relist round.
#[derive(Debug, Clone, PartialEq)]
pub struct RelistDiff {
    /// Whether a batch has to be pushed.
    pub changed: bool,
    /// Full-sync batch: every current allocation plus synthesized removals.
    pub update: AllocationUpdate,
    /// Snapshot to compare the next round against.
    pub snapshot: BTreeMap<PodKey, PodAllocation>,
}

/// Diffs the allocations listed this round against the previous snapshot.
///
/// An empty listing is always reported as changed: a deletion missed while
/// the pod watch was down can only be repaired by a full sync.
pub fn diff_allocations(
    node_name: &str,
    current: Vec<PodAllocation>,
    previous: &BTreeMap<PodKey, PodAllocation>,
) -> RelistDiff {
    let snapshot: BTreeMap<PodKey, PodAllocation> =
        current.into_iter().map(|a| (a.key(), a)).collect();

    let modified = snapshot
        .iter()
        .any(|(key, allocation)| previous.get(key) != Some(allocation));

    let delete: Vec<PodKey> = previous
        .keys()
        .filter(|key| !snapshot.contains_key(*key))
        .cloned()
        .collect();

    let changed = modified || !delete.is_empty() || snapshot.is_empty();

    RelistDiff {
        changed,
        update: AllocationUpdate {
            sync: snapshot.values().cloned().collect(),
            delete,
            node_name: node_name.to_string(),
            full_sync: true,
        },
        snapshot,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use api_types::GpuDevice;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::domain::inventory::cache::tests::FakeDevices;
    use crate::infrastructure::pod_resources::ContainerDevices as KubeletDevices;
    use crate::infrastructure::pod_resources::ContainerResources;

    fn allocation(name: &str, ids: &[&str]) -> PodAllocation {
        PodAllocation {
            namespace: "default".to_string(),
            name: name.to_string(),
            node_name: "n1".to_string(),
            containers: vec![ContainerDevices {
                name: "main".to_string(),
                devices: ids.iter().map(|id| GpuDevice::unresolved(*id, "n1")).collect(),
            }],
        }
    }

    fn snapshot(allocations: &[PodAllocation]) -> BTreeMap<PodKey, PodAllocation> {
        allocations.iter().map(|a| (a.key(), a.clone())).collect()
    }

    fn kubelet_pod(name: &str, groups: &[(&str, &[&str])]) -> PodResources {
        PodResources {
            name: name.to_string(),
            namespace: "default".to_string(),
            containers: vec![ContainerResources {
                name: "main".to_string(),
                devices: groups
                    .iter()
                    .map(|(resource, ids)| KubeletDevices {
                        resource_name: resource.to_string(),
                        device_ids: ids.iter().map(|id| id.to_string()).collect(),
                    })
                    .collect(),
            }],
        }
    }

    #[test]
    fn filter_keeps_only_monitored_resource_devices() {
        let fake = Arc::new(FakeDevices::with(&[("GPU-1", "A100")]));
        let cache = DeviceCache::new("n1", Duration::from_secs(60), fake);
        let pods = vec![
            kubelet_pod("gpu", &[("nvidia.com/gpu", &["GPU-1"]), ("example.com/nic", &["eth1"])]),
            kubelet_pod("nic-only", &[("example.com/nic", &["eth2"])]),
            kubelet_pod("empty", &[("nvidia.com/gpu", &[])]),
        ];

        let allocations = filter_allocations(pods, &cache, "nvidia.com/gpu");

        assert_eq!(allocations.len(), 1);
        let devices = &allocations[0].containers[0].devices;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].model, "A100");
        assert_eq!(allocations[0].node_name, "n1");
    }

    #[test]
    fn unchanged_listing_is_not_changed() {
        let previous = snapshot(&[allocation("p1", &["d1"])]);

        let diff = diff_allocations("n1", vec![allocation("p1", &["d1"])], &previous);

        assert!(!diff.changed, "identical listing should not be pushed");
    }

    #[test]
    fn new_or_modified_allocation_is_changed() {
        let previous = snapshot(&[allocation("p1", &["d1"])]);

        let diff = diff_allocations(
            "n1",
            vec![allocation("p1", &["d1", "d2"]), allocation("p2", &["d3"])],
            &previous,
        );

        assert!(diff.changed);
        assert_eq!(diff.update.sync.len(), 2);
        assert!(diff.update.delete.is_empty());
        assert!(diff.update.full_sync);
    }

    #[test]
    fn vanished_pod_synthesizes_delete() {
        let previous = snapshot(&[allocation("p1", &["d1"]), allocation("p2", &["d2"])]);

        let diff = diff_allocations("n1", vec![allocation("p1", &["d1"])], &previous);

        assert!(diff.changed);
        assert_eq!(diff.update.delete, vec![PodKey::new("default", "p2")]);
        assert_eq!(diff.snapshot.len(), 1);
    }

    #[test]
    fn non_empty_to_empty_deletes_every_previous_entry() {
        let previous = snapshot(&[allocation("p1", &["d1"]), allocation("p2", &["d2"])]);

        let diff = diff_allocations("n1", Vec::new(), &previous);

        assert!(diff.changed, "empty listing should always be changed");
        assert_eq!(
            diff.update.delete,
            vec![PodKey::new("default", "p1"), PodKey::new("default", "p2")]
        );
        assert!(diff.update.sync.is_empty());
    }

    #[test]
    fn empty_listing_is_changed_even_without_history() {
        let diff = diff_allocations("n1", Vec::new(), &BTreeMap::new());

        assert!(diff.changed);
        assert_eq!(diff.update.node_name, "n1");
    }
}
