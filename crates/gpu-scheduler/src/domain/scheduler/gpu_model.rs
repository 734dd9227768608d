use std::sync::Arc;

use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;

use super::pod_ref;
use super::FilterPlugin;
use super::FilterVerdict;
use super::Plugin;
use super::PluginError;
use super::RegisteredPlugin;
use super::ScorePlugin;
use crate::config::GPU_RESOURCE_NAME;
use crate::config::MODEL_ANNOTATION;
use crate::domain::allocation::requested_devices;
use crate::domain::index::ClusterSnapshot;
use crate::domain::inventory::normalize_model;

pub const NAME: &str = "GpuModelFit";

/// Places pods annotated with a device model on nodes that have enough
/// free devices of that model, preferring nodes with more of them.
pub struct GpuModelFit;

pub(super) fn new() -> RegisteredPlugin {
    let plugin = Arc::new(GpuModelFit);
    RegisteredPlugin::new(NAME)
        .with_filter(plugin.clone())
        .with_score(plugin)
}

fn requested_model(pod: &Pod) -> Option<String> {
    let model = pod.metadata.annotations.as_ref()?.get(MODEL_ANNOTATION)?;
    let model = normalize_model(model);
    (!model.is_empty()).then_some(model)
}

impl Plugin for GpuModelFit {
    fn name(&self) -> &'static str {
        NAME
    }
}

impl FilterPlugin for GpuModelFit {
    fn filter(
        &self,
        pod: &Pod,
        node_name: &str,
        snapshot: &ClusterSnapshot,
    ) -> Result<FilterVerdict, Report<PluginError>> {
        let Some(model) = requested_model(pod) else {
            return Ok(FilterVerdict::Accept);
        };

        let Some(node) = snapshot.node(node_name) else {
            return Ok(FilterVerdict::Reject(format!(
                "nodeName:{node_name} is not exist."
            )));
        };
        if !node.is_healthy() {
            return Ok(FilterVerdict::Reject(format!(
                "node:{node_name} is unhealthy"
            )));
        }
        let Some(inventory) = node.inventory.as_ref() else {
            return Ok(FilterVerdict::Reject(format!(
                "node:{node_name} has not reported its devices"
            )));
        };
        if !inventory.models.contains_key(&model) {
            return Ok(FilterVerdict::Reject(format!(
                "node:{node_name} has no device of model {model}"
            )));
        }

        let available = node.free(&model).len() as i64;
        let requested = requested_devices(pod, GPU_RESOURCE_NAME);
        if requested > available {
            return Ok(FilterVerdict::Reject(format!(
                "node:[{node_name}] pod[{}] reqGpuNum:{requested} > availNum:{available}",
                pod_ref(pod)
            )));
        }
        Ok(FilterVerdict::Accept)
    }
}

impl ScorePlugin for GpuModelFit {
    fn score(
        &self,
        pod: &Pod,
        node_name: &str,
        snapshot: &ClusterSnapshot,
    ) -> Result<i64, Report<PluginError>> {
        let Some(model) = requested_model(pod) else {
            return Ok(0);
        };
        Ok(snapshot
            .node(node_name)
            .filter(|node| node.is_healthy())
            .map(|node| node.free(&model).len() as i64)
            .unwrap_or(0))
    }
}
