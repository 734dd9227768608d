pub mod k8s;
pub mod nvml;
pub mod pod_resources;
pub mod server_client;
