//! Scheduler extender decision engine.

mod extender;
mod framework;
pub(crate) mod gpu_model;
mod parallel;

pub use extender::SchedulerService;
pub use framework::FilterPlugin;
pub use framework::FilterVerdict;
pub use framework::Framework;
pub use framework::Plugin;
pub use framework::PluginError;
pub use framework::Registry;
pub use framework::RegisteredPlugin;
pub use framework::ScorePlugin;
pub use gpu_model::GpuModelFit;
pub use parallel::parallelize_until;

use k8s_openapi::api::core::v1::Pod;

/// `namespace/name` of a pod, for logs and rejection reasons.
pub(crate) fn pod_ref(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or("default"),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}
