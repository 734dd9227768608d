//! Agent side components pushing to a live central service, which then
//! answers extender calls from the pushed state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use api_types::ExtenderArgs;
use api_types::ExtenderFilterResult;
use api_types::HostPriority;
use async_trait::async_trait;
use error_stack::Report;
use gpu_scheduler::allocation::AllocationPublisher;
use gpu_scheduler::allocation::AllocationRelister;
use gpu_scheduler::api::ApiServer;
use gpu_scheduler::api::ApiState;
use gpu_scheduler::api::IngestTarget;
use gpu_scheduler::config::api_prefix;
use gpu_scheduler::config::MODEL_ANNOTATION;
use gpu_scheduler::index::ResourceIndex;
use gpu_scheduler::infrastructure::pod_resources::ContainerDevices;
use gpu_scheduler::infrastructure::pod_resources::ContainerResources;
use gpu_scheduler::infrastructure::pod_resources::PodResources;
use gpu_scheduler::infrastructure::pod_resources::PodResourcesSource;
use gpu_scheduler::infrastructure::server_client::ServerClient;
use gpu_scheduler::inventory::DeviceCache;
use gpu_scheduler::inventory::DeviceDescription;
use gpu_scheduler::inventory::DeviceError;
use gpu_scheduler::inventory::DeviceQuery;
use gpu_scheduler::inventory::InventoryScanner;
use gpu_scheduler::k8s::KubernetesError;
use gpu_scheduler::liveness::HealthChecker;
use gpu_scheduler::liveness::HealthProbe;
use gpu_scheduler::liveness::NodeHealthTracker;
use gpu_scheduler::scheduler::Framework;
use gpu_scheduler::scheduler::Registry;
use gpu_scheduler::scheduler::SchedulerService;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use similar_asserts::assert_eq;
use tokio_util::sync::CancellationToken;

const NODE: &str = "gpu-node-1";

struct TwoA100s;

impl DeviceQuery for TwoA100s {
    fn device_count(&self) -> Result<u32, Report<DeviceError>> {
        Ok(2)
    }

    fn uuid_by_index(&self, index: u32) -> Result<String, Report<DeviceError>> {
        Ok(format!("GPU-{index}"))
    }

    fn describe(&self, device_id: &str) -> Result<DeviceDescription, Report<DeviceError>> {
        Ok(DeviceDescription {
            brand: "BRAND_TESLA".to_string(),
            model: "NVIDIA A100".to_string(),
            bus_id: format!("00000000:{device_id}"),
        })
    }

    fn reinitialize(&self) -> Result<(), Report<DeviceError>> {
        Ok(())
    }
}

/// Kubelet view with one pod bound to `GPU-0`.
struct OneTrainer;

#[async_trait]
impl PodResourcesSource for OneTrainer {
    async fn list(&self) -> Result<Vec<PodResources>, Report<KubernetesError>> {
        Ok(vec![PodResources {
            name: "trainer".to_string(),
            namespace: "ml".to_string(),
            containers: vec![ContainerResources {
                name: "main".to_string(),
                devices: vec![ContainerDevices {
                    resource_name: "nvidia.com/gpu".to_string(),
                    device_ids: vec!["GPU-0".to_string()],
                }],
            }],
        }])
    }
}

fn pod_asking_for(model: &str, devices: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some("incoming".to_string()),
            namespace: Some("ml".to_string()),
            annotations: Some(BTreeMap::from([(
                MODEL_ANNOTATION.to_string(),
                model.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                resources: Some(ResourceRequirements {
                    limits: Some(BTreeMap::from([(
                        "nvidia.com/gpu".to_string(),
                        Quantity(devices.to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    }
}

async fn start_server(listen_addr: &str, token: &CancellationToken) {
    let (index, actor) = ResourceIndex::new(16);
    tokio::spawn(actor.run(token.clone()));
    let tracker = Arc::new(NodeHealthTracker::new(
        Duration::from_secs(30),
        Some(index.clone()),
    ));
    let scheduler = Arc::new(SchedulerService::new(
        Framework::new(&Registry::in_tree()),
        index.clone(),
        4,
    ));
    let server = ApiServer::new(
        ApiState {
            scheduler,
            ingest: IngestTarget::Memory(index.clone()),
            tracker,
            index,
        },
        listen_addr.to_string(),
    );
    tokio::spawn(server.run(token.clone()));
}

async fn post_filter(base: &str, pod: Pod) -> ExtenderFilterResult {
    reqwest::Client::new()
        .post(format!("{base}{}/schedule/filter", api_prefix()))
        .json(&ExtenderArgs {
            pod,
            node_names: Some(vec![NODE.to_string(), "cpu-node".to_string()]),
        })
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[test_log::test(tokio::test)]
async fn agent_reports_drive_extender_decisions() {
    // Arrange
    let token = CancellationToken::new();
    let listen_addr = "127.0.0.1:38917";
    let base = format!("http://{listen_addr}");
    start_server(listen_addr, &token).await;

    let client = ServerClient::new(base.clone(), NODE).unwrap();
    let mut ready = false;
    for _ in 0..100 {
        // the probe doubles as the node's first heartbeat
        if client.probe().await.is_ok() {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(ready, "server should come up");

    let cache = Arc::new(DeviceCache::new(NODE, Duration::from_secs(5), Arc::new(TwoA100s)));
    let inventory = InventoryScanner::new(cache.clone(), Duration::from_secs(2))
        .scan_once()
        .expect("first scan should report the inventory");
    client.publish_inventory(&inventory).await.unwrap();

    let health = HealthChecker::new(
        Arc::new(client.clone()),
        Duration::from_secs(1),
        1,
        Duration::from_secs(1),
    );
    let mut relister = AllocationRelister::new(
        cache,
        Arc::new(OneTrainer),
        Arc::new(client.clone()),
        health,
        Duration::from_secs(1),
        Duration::from_secs(30),
    );

    // Act
    relister.relist(&token).await;
    let one = post_filter(&base, pod_asking_for("nvidia a100", "1")).await;
    let two = post_filter(&base, pod_asking_for("nvidia a100", "2")).await;
    let priorities: Vec<HostPriority> = reqwest::Client::new()
        .post(format!("{base}{}/schedule/prioritize", api_prefix()))
        .json(&ExtenderArgs {
            pod: pod_asking_for("NVIDIA A100", "1"),
            node_names: Some(vec!["cpu-node".to_string(), NODE.to_string()]),
        })
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    // Assert
    assert_eq!(one.node_names, Some(vec![NODE.to_string()]));
    assert!(one.failed_nodes.contains_key("cpu-node"));
    assert_eq!(
        two.node_names,
        Some(vec![]),
        "one of the two devices is held by the trainer pod"
    );
    assert_eq!(
        priorities,
        vec![
            HostPriority { host: NODE.to_string(), score: 1 },
            HostPriority { host: "cpu-node".to_string(), score: 0 },
        ]
    );

    token.cancel();
}
