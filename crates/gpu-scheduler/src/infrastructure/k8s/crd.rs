//! `GpuNode` and `GpuPod` custom resources backing the crd store mode.

use std::collections::BTreeMap;

use api_types::ContainerDevices;
use api_types::GpuDevice;
use api_types::NodeInventory;
use api_types::PodAllocation;
use chrono::DateTime;
use chrono::Utc;
use kube::CustomResource;
use kube::CustomResourceExt;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::domain::index::NodeRecord;
use crate::domain::index::NodeView;
use crate::domain::liveness::NodeHealth;

/// Label put on every `GpuPod` so a node's records can be listed.
pub const NODE_LABEL: &str = "nvidia-gpu-scheduler/node";

pub const HEALTH_TRUE: &str = "True";
pub const HEALTH_FALSE: &str = "False";

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "resources.nvidia-gpu-scheduler.io",
    version = "v1",
    kind = "GpuNode",
    status = "GpuNodeStatus",
    printcolumn = r#"{"name":"HEALTH","type":"string","jsonPath":".status.health"}"#,
    printcolumn = r#"{"name":"LastHealthyTime","type":"string","jsonPath":".status.last_health_time"}"#,
    printcolumn = r#"{"name":"MESSAGE","type":"string","jsonPath":".status.message"}"#
)]
pub struct GpuNodeSpec {
    /// device id -> device
    #[serde(rename = "device_infos", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub devices: BTreeMap<String, GpuDevice>,
    /// normalized model -> device ids
    #[serde(rename = "device_models", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub models: BTreeMap<String, Vec<String>>,
    #[serde(rename = "device_busy", default)]
    pub busy: Vec<String>,
    #[serde(rename = "report_time", default, skip_serializing_if = "Option::is_none")]
    pub report_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GpuNodeStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node: String,
    /// `True` or `False`, empty until first evaluated
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub health: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "resources.nvidia-gpu-scheduler.io",
    version = "v1",
    kind = "GpuPod",
    namespaced,
    status = "GpuPodStatus",
    printcolumn = r#"{"name":"NODE","type":"string","jsonPath":".spec.node_name"}"#,
    printcolumn = r#"{"name":"UPDATE","type":"string","jsonPath":".status.last_changed_time"}"#
)]
pub struct GpuPodSpec {
    #[serde(default)]
    pub pod_name: String,
    #[serde(default)]
    pub pod_namespace: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(rename = "containers_device", default)]
    pub containers: Vec<ContainerDevices>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GpuPodStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_changed_time: Option<DateTime<Utc>>,
}

impl GpuNodeSpec {
    pub fn from_inventory(inventory: &NodeInventory, busy: Vec<String>) -> Self {
        Self {
            devices: inventory.devices.clone(),
            models: inventory
                .models
                .iter()
                .map(|(model, ids)| (model.clone(), ids.iter().cloned().collect()))
                .collect(),
            busy,
            report_time: inventory.report_time,
        }
    }

    /// Whether the agent has ever reported into this record.
    pub fn has_inventory(&self) -> bool {
        self.report_time.is_some() || !self.devices.is_empty()
    }

    pub fn inventory(&self, node_name: &str) -> NodeInventory {
        NodeInventory {
            node_name: node_name.to_string(),
            devices: self.devices.clone(),
            models: self
                .models
                .iter()
                .map(|(model, ids)| (model.clone(), ids.iter().cloned().collect()))
                .collect(),
            report_time: self.report_time,
        }
    }
}

impl GpuNodeStatus {
    pub fn is_healthy(&self) -> Option<bool> {
        match self.health.as_str() {
            HEALTH_TRUE => Some(true),
            HEALTH_FALSE => Some(false),
            _ => None,
        }
    }

    pub fn health_label(healthy: bool) -> &'static str {
        if healthy {
            HEALTH_TRUE
        } else {
            HEALTH_FALSE
        }
    }
}

impl GpuNode {
    pub fn record(&self) -> NodeRecord {
        let name = self.name_any();
        let inventory = self
            .spec
            .has_inventory()
            .then(|| self.spec.inventory(&name));
        let health = self.status.as_ref().and_then(|status| {
            Some(NodeHealth {
                node_name: name.clone(),
                healthy: status.is_healthy()?,
                last_healthy_at: status.last_health_time,
            })
        });
        NodeRecord {
            name,
            inventory,
            health,
        }
    }

    /// Renders an index node in the persisted shape served to watchers.
    pub fn from_view(view: &NodeView) -> Self {
        let spec = match &view.inventory {
            Some(inventory) => {
                GpuNodeSpec::from_inventory(inventory, view.busy.iter().cloned().collect())
            }
            None => GpuNodeSpec {
                busy: view.busy.iter().cloned().collect(),
                ..Default::default()
            },
        };
        let mut node = GpuNode::new(&view.name, spec);
        node.status = view.health.as_ref().map(|health| GpuNodeStatus {
            node: view.name.clone(),
            health: GpuNodeStatus::health_label(health.healthy).to_string(),
            last_health_time: health.last_healthy_at,
            ..Default::default()
        });
        node
    }
}

impl GpuPod {
    pub fn allocation(&self) -> PodAllocation {
        PodAllocation {
            namespace: if self.spec.pod_namespace.is_empty() {
                self.namespace().unwrap_or_default()
            } else {
                self.spec.pod_namespace.clone()
            },
            name: if self.spec.pod_name.is_empty() {
                self.name_any()
            } else {
                self.spec.pod_name.clone()
            },
            node_name: self.spec.node_name.clone(),
            containers: self.spec.containers.clone(),
        }
    }

    pub fn from_allocation(allocation: &PodAllocation) -> Self {
        let mut pod = GpuPod::new(
            &allocation.name,
            GpuPodSpec {
                pod_name: allocation.name.clone(),
                pod_namespace: allocation.namespace.clone(),
                node_name: allocation.node_name.clone(),
                containers: allocation.containers.clone(),
            },
        );
        pod.metadata.namespace = Some(allocation.namespace.clone());
        pod.metadata.labels = Some(BTreeMap::from([(
            NODE_LABEL.to_string(),
            allocation.node_name.clone(),
        )]));
        pod
    }
}

/// Both custom resource definitions as a multi document YAML stream.
pub fn crd_manifests() -> Result<String, serde_yaml::Error> {
    let nodes = serde_yaml::to_string(&GpuNode::crd())?;
    let pods = serde_yaml::to_string(&GpuPod::crd())?;
    Ok(format!("{nodes}---\n{pods}"))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use similar_asserts::assert_eq;

    use super::*;

    fn inventory() -> NodeInventory {
        NodeInventory {
            node_name: "n1".to_string(),
            devices: BTreeMap::from([(
                "d1".to_string(),
                GpuDevice::unresolved("d1", "n1"),
            )]),
            models: BTreeMap::from([("a100".to_string(), BTreeSet::from(["d1".to_string()]))]),
            report_time: Some(Utc::now()),
        }
    }

    #[test]
    fn node_record_round_trips_inventory_and_health() {
        let mut node = GpuNode::new("n1", GpuNodeSpec::from_inventory(&inventory(), vec![]));
        node.status = Some(GpuNodeStatus {
            health: HEALTH_FALSE.to_string(),
            ..Default::default()
        });

        let record = node.record();

        assert_eq!(record.inventory, Some(inventory()));
        assert_eq!(record.health.map(|h| h.healthy), Some(false));
    }

    #[test]
    fn node_without_report_has_no_inventory_or_health() {
        let record = GpuNode::new("n1", GpuNodeSpec::default()).record();

        assert!(record.inventory.is_none());
        assert!(record.health.is_none());
    }

    #[test]
    fn pod_record_is_labelled_with_its_node() {
        let allocation = PodAllocation {
            namespace: "team".to_string(),
            name: "trainer".to_string(),
            node_name: "n1".to_string(),
            containers: vec![],
        };

        let pod = GpuPod::from_allocation(&allocation);

        assert_eq!(pod.namespace().as_deref(), Some("team"));
        assert_eq!(pod.labels().get(NODE_LABEL).map(String::as_str), Some("n1"));
        assert_eq!(pod.allocation(), allocation);
    }

    #[test]
    fn manifests_contain_both_definitions() {
        let yaml = crd_manifests().unwrap();

        assert!(yaml.contains("gpunodes.resources.nvidia-gpu-scheduler.io"));
        assert!(yaml.contains("gpupods.resources.nvidia-gpu-scheduler.io"));
        assert!(yaml.contains("scope: Cluster"));
        assert!(yaml.contains("scope: Namespaced"));
    }
}
