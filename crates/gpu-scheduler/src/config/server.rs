use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use clap::ValueEnum;

use super::DEFAULT_PARALLELISM;

/// Where the central service keeps its canonical state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreMode {
    /// In-process resource index only
    Memory,
    /// GpuNode / GpuPod custom resources mirrored into the index
    Crd,
}

#[derive(Parser, Clone, Debug)]
pub struct ServerArgs {
    #[arg(
        long,
        env = "API_LISTEN_ADDR",
        default_value = "0.0.0.0:8080",
        help = "HTTP listen address of the extender and push API"
    )]
    pub listen_addr: String,

    #[arg(
        long,
        env = "GPU_SCHEDULER_STORE_MODE",
        value_enum,
        default_value = "memory"
    )]
    pub store_mode: StoreMode,

    #[arg(
        long,
        default_value = "10",
        allow_negative_numbers = true,
        help = "Worker count for filter and score evaluation"
    )]
    pub parallelism: i64,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        default_value = "6",
        help = "Seconds without heartbeat after which a node is unhealthy"
    )]
    pub node_health_ttl_secs: u64,

    #[arg(long, default_value = "1000")]
    pub node_health_check_interval_ms: u64,

    #[arg(long, default_value = "100", help = "Lease monitor evaluation period")]
    pub monitor_period_ms: u64,

    #[arg(
        long,
        default_value = "4",
        help = "Seconds a lease may stay unrenewed before the node is unhealthy"
    )]
    pub monitor_grace_period_secs: u64,

    #[arg(
        long,
        env = "POD_NAME",
        help = "Leader election identity (defaults to the hostname)"
    )]
    pub identity: Option<String>,

    #[arg(
        long,
        env = "GPU_SCHEDULER_DECISION_LOG",
        value_hint = clap::ValueHint::FilePath,
        help = "File receiving one line per filter and score verdict"
    )]
    pub decision_log_file: Option<PathBuf>,
}

impl ServerArgs {
    pub fn parallelism(&self) -> usize {
        if self.parallelism <= 0 {
            DEFAULT_PARALLELISM
        } else {
            self.parallelism as usize
        }
    }

    pub fn node_health_ttl(&self) -> Duration {
        Duration::from_secs(self.node_health_ttl_secs)
    }

    pub fn node_health_check_interval(&self) -> Duration {
        Duration::from_millis(self.node_health_check_interval_ms.max(1))
    }

    pub fn monitor_period(&self) -> Duration {
        Duration::from_millis(self.monitor_period_ms.max(1))
    }

    pub fn monitor_grace_period(&self) -> Duration {
        Duration::from_secs(self.monitor_grace_period_secs)
    }

    pub fn identity(&self) -> String {
        self.identity
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("gpu-scheduler-{}", uuid::Uuid::new_v4()))
    }
}
