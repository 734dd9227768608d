use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Clone, Debug)]
pub struct AgentArgs {
    #[arg(
        long,
        env = "NODENAME",
        help = "Name of the node this agent runs on"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "GPU_SCHEDULER_SERVER_URL",
        default_value = "http://nvidia-gpu-scheduler.kube-system.svc:8080",
        help = "Base URL of the central scheduler service"
    )]
    pub server_url: String,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "POD_RESOURCES_SOCKET",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/var/lib/kubelet/pod-resources/kubelet.sock",
        help = "Kubelet pod-resources gRPC socket"
    )]
    pub pod_resources_socket: PathBuf,

    #[arg(long, default_value = "2000", help = "Device scan interval in milliseconds")]
    pub scan_interval_ms: u64,

    #[arg(long, default_value = "5000", help = "Device metadata cache TTL in milliseconds")]
    pub device_cache_ttl_ms: u64,

    #[arg(
        long,
        default_value = "30",
        help = "Fallback relist cadence in seconds when no pod event arrives"
    )]
    pub relist_interval_secs: u64,

    #[arg(long, default_value = "2", help = "Heartbeat interval in seconds")]
    pub health_check_interval_secs: u64,

    #[arg(long, default_value = "6", help = "Timeout of one health probe in seconds")]
    pub health_probe_timeout_secs: u64,

    #[arg(
        long,
        default_value = "3",
        help = "Number of parallel probes raced while waiting for the service"
    )]
    pub health_probe_workers: usize,

    #[arg(
        long,
        help = "Renew a node lease for the lease lifecycle monitor",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_lease: bool,

    #[arg(long, default_value = "8", help = "Node lease duration in seconds")]
    pub lease_duration_secs: u64,
}

impl AgentArgs {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn device_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.device_cache_ttl_ms)
    }

    pub fn relist_interval(&self) -> Duration {
        Duration::from_secs(self.relist_interval_secs.max(1))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.health_probe_timeout_secs.max(1))
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use similar_asserts::assert_eq;

    use crate::config::Cli;
    use crate::config::Commands;

    #[test]
    fn agent_defaults() {
        let cli = Cli::try_parse_from(["gpu-scheduler", "agent", "--node-name", "n1"]).unwrap();

        let Commands::Agent(args) = cli.command else {
            panic!("should parse the agent subcommand");
        };
        assert_eq!(args.node_name, "n1");
        assert_eq!(args.scan_interval_ms, 2000);
        assert_eq!(args.health_probe_workers, 3);
        assert!(args.enable_lease);
        assert_eq!(args.lease_duration().as_secs(), 8);
    }

    #[test]
    fn lease_can_be_disabled() {
        let cli = Cli::try_parse_from([
            "gpu-scheduler",
            "agent",
            "--node-name",
            "n1",
            "--enable-lease",
            "false",
        ])
        .unwrap();

        let Commands::Agent(args) = cli.command else {
            panic!("should parse the agent subcommand");
        };
        assert!(!args.enable_lease);
    }
}
