use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;

use crate::infrastructure::k8s::KubernetesError;

/// Messages of the kubelet `v1.PodResourcesLister` service.
///
/// Only the fields read by the allocation watcher are declared; the kubelet
/// sends more (cpu ids, memory, topology) which prost skips on decode.
pub mod v1 {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ListPodResourcesRequest {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ListPodResourcesResponse {
        #[prost(message, repeated, tag = "1")]
        pub pod_resources: ::prost::alloc::vec::Vec<PodResources>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PodResources {
        #[prost(string, tag = "1")]
        pub name: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub namespace: ::prost::alloc::string::String,
        #[prost(message, repeated, tag = "3")]
        pub containers: ::prost::alloc::vec::Vec<ContainerResources>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ContainerResources {
        #[prost(string, tag = "1")]
        pub name: ::prost::alloc::string::String,
        #[prost(message, repeated, tag = "2")]
        pub devices: ::prost::alloc::vec::Vec<ContainerDevices>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ContainerDevices {
        #[prost(string, tag = "1")]
        pub resource_name: ::prost::alloc::string::String,
        #[prost(string, repeated, tag = "2")]
        pub device_ids: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    }
}

pub use v1::ContainerDevices;
pub use v1::ContainerResources;
pub use v1::PodResources;

const LIST_PATH: &str = "/v1.PodResourcesLister/List";

/// Source of the node's current pod to device bindings.
#[async_trait]
pub trait PodResourcesSource: Send + Sync {
    async fn list(&self) -> Result<Vec<PodResources>, Report<KubernetesError>>;
}

/// Kubelet pod-resources client over its unix socket.
pub struct KubeletPodResources {
    socket_path: PathBuf,
}

impl KubeletPodResources {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Create a gRPC channel connected to the kubelet unix socket
    async fn create_unix_channel(&self) -> Result<tonic::transport::Channel, io::Error> {
        use hyper_util::rt::TokioIo;
        use tonic::transport::Endpoint;
        use tonic::transport::Uri;
        use tower::service_fn;

        let socket_path = self.socket_path.clone();

        // the authority is ignored, every connection goes to the socket
        let channel = Endpoint::try_from("http://[::]:50051")
            .map_err(|e| io::Error::other(e.to_string()))?
            .connect_with_connector(service_fn(move |_: Uri| {
                let socket_path = socket_path.clone();
                async move {
                    tokio::net::UnixStream::connect(socket_path)
                        .await
                        .map(TokioIo::new)
                }
            }))
            .await
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(channel)
    }
}

#[async_trait]
impl PodResourcesSource for KubeletPodResources {
    async fn list(&self) -> Result<Vec<PodResources>, Report<KubernetesError>> {
        let channel = self.create_unix_channel().await.change_context(
            KubernetesError::ConnectionFailed {
                message: format!(
                    "Failed to connect to kubelet socket {}",
                    self.socket_path.display()
                ),
            },
        )?;

        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| KubernetesError::ConnectionFailed {
                message: format!("kubelet pod-resources service not ready: {e}"),
            })?;

        let path = tonic::codegen::http::uri::PathAndQuery::from_static(LIST_PATH);
        let codec = tonic::codec::ProstCodec::<v1::ListPodResourcesRequest, v1::ListPodResourcesResponse>::default();
        let response = grpc
            .unary(
                tonic::Request::new(v1::ListPodResourcesRequest {}),
                path,
                codec,
            )
            .await
            .map_err(|status| KubernetesError::RequestFailed {
                message: format!("kubelet pod-resources List failed: {status}"),
            })?;

        Ok(response.into_inner().pod_resources)
    }
}
