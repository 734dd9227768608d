pub mod agent;
pub mod cli;
pub mod server;

use std::time::Duration;

pub use agent::*;
pub use cli::*;
pub use server::*;

/// Group and version of every HTTP path served by the central service.
pub const API_GROUP: &str = "nvidia-gpu-scheduler";
pub const API_VERSION: &str = "v1";

/// Pod annotation carrying the requested device model.
pub const MODEL_ANNOTATION: &str = "nvidia-gpu-scheduler/gpu.model";

/// Extended resource advertised by the device plugin.
pub const GPU_RESOURCE_NAME: &str = "nvidia.com/gpu";

/// Namespace holding one node lease per agent.
pub const LEASE_NAMESPACE: &str = "nvidia-gpu-scheduler-node-lease";

/// Lock used to elect the lease lifecycle monitor.
pub const LEADER_LOCK_NAME: &str = "gpunode-lifecycle-controller";
pub const LEADER_LEASE_DURATION: Duration = Duration::from_secs(15);
pub const LEADER_RENEW_DEADLINE: Duration = Duration::from_secs(10);
pub const LEADER_RETRY_PERIOD: Duration = Duration::from_secs(2);

/// Fraction of the lease duration after which an agent renews its lease.
pub const LEASE_RENEW_FRACTION: f64 = 0.25;

pub const LIST_TIMEOUT: Duration = Duration::from_secs(5);
pub const WATCH_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const PUSH_MAX_ATTEMPTS: u32 = 4;
pub const RELIST_CHANNEL_CAPACITY: usize = 10;
pub const WATCHER_CHANNEL_CAPACITY: usize = 100;
pub const DEFAULT_PARALLELISM: usize = 10;

/// `/apis/<group>/<version>` prefix shared by the extender and watch routes.
pub fn api_prefix() -> String {
    format!("/apis/{API_GROUP}/{API_VERSION}")
}
