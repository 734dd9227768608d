//! Kubernetes integration: client setup, the `GpuNode` / `GpuPod` records,
//! node leases and the pod watcher of the node agent.

mod client;
pub mod crd;
mod leader;
mod lease;
mod mirror;
mod pod_watcher;
mod store;
mod types;

pub use client::init_kube_client;
pub use crd::crd_manifests;
pub use crd::GpuNode;
pub use crd::GpuPod;
pub use leader::can_acquire;
pub use leader::LeaderElector;
pub use leader::LockDecision;
pub use lease::ensure_lease_namespace;
pub use lease::LeaseMonitor;
pub use lease::LeaseRenewer;
pub use mirror::CrdMirror;
pub use pod_watcher::PodSignal;
pub use pod_watcher::PodWatcher;
pub use store::retry_on_conflict;
pub use store::CrdStore;
pub use types::is_conflict;
pub use types::is_not_found;
pub use types::is_status;
pub use types::KubernetesError;
