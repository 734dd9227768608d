//! Shared API type definitions
//!
//! This crate contains the wire types exchanged between the node agent and the
//! central scheduling service: accelerator inventory, pod allocation batches,
//! scheduler extender request/response bodies and watch stream events.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// Metadata of one accelerator, resolved by the node agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GpuDevice {
    /// Stable device identifier (GPU UUID)
    #[serde(rename = "device_id", default, skip_serializing_if = "String::is_empty")]
    pub device_id: String,
    /// Device brand, e.g. `BRAND_TESLA`
    #[serde(rename = "device_brand", default, skip_serializing_if = "String::is_empty")]
    pub brand: String,
    /// Marketing name as reported by the driver, e.g. `NVIDIA A100-SXM4-80GB`
    #[serde(rename = "device_model", default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    /// PCI bus id
    #[serde(rename = "device_busid", default, skip_serializing_if = "String::is_empty")]
    pub bus_id: String,
    /// Node hosting the device
    #[serde(rename = "device_node", default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
}

impl GpuDevice {
    /// A device record carrying only its identity, used when resolution fails.
    pub fn unresolved(device_id: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            node_name: node_name.into(),
            ..Default::default()
        }
    }
}

/// Full accelerator inventory of one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInventory {
    #[serde(rename = "device_node", default)]
    pub node_name: String,
    /// device id -> device
    #[serde(rename = "device_infos", default)]
    pub devices: BTreeMap<String, GpuDevice>,
    /// normalized model -> device ids
    #[serde(rename = "device_models", default)]
    pub models: BTreeMap<String, BTreeSet<String>>,
    /// When the agent reported the inventory
    #[serde(rename = "report_time", default, skip_serializing_if = "Option::is_none")]
    pub report_time: Option<DateTime<Utc>>,
}

/// Devices bound to one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ContainerDevices {
    #[serde(rename = "container_name", default)]
    pub name: String,
    #[serde(rename = "device_info", default)]
    pub devices: Vec<GpuDevice>,
}

/// Identity of a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Accelerator bindings of one pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodAllocation {
    #[serde(rename = "pod_namespace", default)]
    pub namespace: String,
    #[serde(rename = "pod_name", default)]
    pub name: String,
    #[serde(rename = "node_name", default)]
    pub node_name: String,
    #[serde(rename = "containers_device", default)]
    pub containers: Vec<ContainerDevices>,
}

impl PodAllocation {
    pub fn key(&self) -> PodKey {
        PodKey::new(&self.namespace, &self.name)
    }

    /// All device ids bound to any container of this pod.
    pub fn device_ids(&self) -> impl Iterator<Item = &str> {
        self.containers
            .iter()
            .flat_map(|c| c.devices.iter())
            .map(|d| d.device_id.as_str())
    }
}

/// Allocation diff batch pushed by a node agent.
///
/// `sync` carries every allocation currently present on the node, `delete`
/// the pods that disappeared since the previous batch. A `full_sync` batch
/// comes from a complete relist and replaces the node's whole pod set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationUpdate {
    #[serde(default)]
    pub sync: Vec<PodAllocation>,
    #[serde(default)]
    pub delete: Vec<PodKey>,
    #[serde(rename = "nodeName", default)]
    pub node_name: String,
    #[serde(rename = "fullSync", default)]
    pub full_sync: bool,
}

impl AllocationUpdate {
    /// A batch removing a single pod.
    pub fn removal(node_name: impl Into<String>, key: PodKey) -> Self {
        Self {
            sync: Vec::new(),
            delete: vec![key],
            node_name: node_name.into(),
            full_sync: false,
        }
    }
}

/// Arguments of the filter and prioritize extender calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExtenderArgs {
    pub pod: Pod,
    #[serde(default)]
    pub node_names: Option<Vec<String>>,
}

/// Result of the filter extender call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExtenderFilterResult {
    pub node_names: Option<Vec<String>>,
    /// node name -> rejection reason
    #[serde(default)]
    pub failed_nodes: BTreeMap<String, String>,
    #[serde(default)]
    pub error: String,
}

/// Score of one host, as returned by the prioritize extender call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostPriority {
    pub host: String,
    pub score: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaPod {
    #[serde(rename = "UID")]
    pub uid: String,
}

/// Victims proposed by the scheduler for one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaVictims {
    #[serde(rename = "Pods", default)]
    pub pods: Vec<MetaPod>,
    #[serde(rename = "NumPDBViolations", default)]
    pub num_pdb_violations: i64,
}

/// Arguments of the preempt extender call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExtenderPreemptionArgs {
    pub pod: Pod,
    #[serde(default)]
    pub node_name_to_meta_victims: BTreeMap<String, MetaVictims>,
}

/// Result of the preempt extender call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExtenderPreemptionResult {
    pub node_name_to_meta_victims: BTreeMap<String, MetaVictims>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchEventType {
    Synced,
    Deleted,
}

/// One event of a watch stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent<T> {
    #[serde(rename = "Type")]
    pub event_type: WatchEventType,
    #[serde(rename = "Object")]
    pub object: T,
}

impl<T> WatchEvent<T> {
    pub fn synced(object: T) -> Self {
        Self {
            event_type: WatchEventType::Synced,
            object,
        }
    }

    pub fn deleted(object: T) -> Self {
        Self {
            event_type: WatchEventType::Deleted,
            object,
        }
    }
}
