//! Pod allocation tracking on a node agent.
//!
//! The relister periodically lists the kubelet's device assignments, diffs
//! them against the previous round and pushes the result to the central
//! service. Pod watch events only trigger relists or immediate removals.

mod differ;
pub(crate) mod publisher;
mod relister;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

pub use differ::diff_allocations;
pub use differ::filter_allocations;
pub use differ::RelistDiff;
pub use publisher::push_with_retry;
pub use publisher::AllocationPublisher;
pub use publisher::PushError;
pub use publisher::RetryPolicy;
pub use relister::AllocationRelister;
pub use relister::RelisterChannels;

/// Parses an integer resource quantity. Milli-units are truncated, anything
/// else unparseable counts as zero.
pub fn parse_quantity(quantity: &Quantity) -> i64 {
    let raw = quantity.0.trim();
    if let Ok(value) = raw.parse::<i64>() {
        return value;
    }
    if let Some(milli) = raw.strip_suffix('m') {
        if let Ok(value) = milli.parse::<i64>() {
            return value / 1000;
        }
    }
    if let Ok(value) = raw.parse::<f64>() {
        return value as i64;
    }
    tracing::warn!(quantity = raw, "unparseable resource quantity");
    0
}

/// Sum of the `resource` limits over all containers of `pod`.
pub fn requested_devices(pod: &Pod, resource: &str) -> i64 {
    pod.spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .filter_map(|c| c.resources.as_ref()?.limits.as_ref()?.get(resource))
                .map(parse_quantity)
                .sum()
        })
        .unwrap_or(0)
}

/// Whether any container of `pod` asks for a non-zero amount of `resource`.
pub fn requests_devices(pod: &Pod, resource: &str) -> bool {
    let Some(spec) = pod.spec.as_ref() else {
        return false;
    };
    spec.containers.iter().any(|c| {
        let Some(resources) = c.resources.as_ref() else {
            return false;
        };
        [resources.limits.as_ref(), resources.requests.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(|values| values.get(resource))
            .any(|q| parse_quantity(q) > 0)
    })
}

/// Running and not being deleted.
pub fn is_running(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|phase| phase == "Running")
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::Container;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use similar_asserts::assert_eq;

    use super::*;

    /// Pod with one container per entry of `limits`.
    pub(crate) fn gpu_pod(name: &str, limits: &[&str], phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: limits
                    .iter()
                    .enumerate()
                    .map(|(i, limit)| Container {
                        name: format!("c{i}"),
                        resources: Some(ResourceRequirements {
                            limits: Some(BTreeMap::from([(
                                "nvidia.com/gpu".to_string(),
                                Quantity(limit.to_string()),
                            )])),
                            ..Default::default()
                        }),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn quantity_parsing() {
        assert_eq!(parse_quantity(&Quantity("2".to_string())), 2);
        assert_eq!(parse_quantity(&Quantity("2000m".to_string())), 2);
        assert_eq!(parse_quantity(&Quantity("1.0".to_string())), 1);
        assert_eq!(parse_quantity(&Quantity("lots".to_string())), 0);
    }

    #[test]
    fn requested_devices_sums_container_limits() {
        let pod = gpu_pod("p", &["1", "2"], "Pending");

        assert_eq!(requested_devices(&pod, "nvidia.com/gpu"), 3);
        assert_eq!(requested_devices(&pod, "amd.com/gpu"), 0);
    }

    #[test]
    fn zero_quantity_does_not_count_as_request() {
        assert!(!requests_devices(&gpu_pod("p", &["0"], "Running"), "nvidia.com/gpu"));
        assert!(requests_devices(&gpu_pod("p", &["0", "1"], "Running"), "nvidia.com/gpu"));
    }

    #[test]
    fn deleting_pod_is_not_running() {
        let mut pod = gpu_pod("p", &["1"], "Running");
        assert!(is_running(&pod));

        pod.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        assert!(!is_running(&pod), "terminating pod should not count as running");
    }
}
