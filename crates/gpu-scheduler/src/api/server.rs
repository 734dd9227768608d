use std::sync::Arc;

use error_stack::Report;
use poem::get;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::post;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Response;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::errors::ApiError;
use super::extender;
use super::ingest;
use super::ingest::IngestTarget;
use super::watch;
use crate::config::api_prefix;
use crate::domain::index::ResourceIndex;
use crate::domain::liveness::NodeHealthTracker;
use crate::domain::scheduler::SchedulerService;
use crate::infrastructure::server_client::ALLOCATIONS_PATH;
use crate::infrastructure::server_client::HEALTH_PATH;
use crate::infrastructure::server_client::INVENTORY_PATH;

/// Everything the handlers need.
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<SchedulerService>,
    pub ingest: IngestTarget,
    pub tracker: Arc<NodeHealthTracker>,
    pub index: ResourceIndex,
}

pub fn routes(state: ApiState) -> impl Endpoint<Output = Response> {
    let prefix = api_prefix();
    Route::new()
        .at(format!("{prefix}/schedule/filter"), post(extender::filter))
        .at(format!("{prefix}/schedule/prioritize"), post(extender::prioritize))
        .at(format!("{prefix}/schedule/preempt"), post(extender::preempt))
        .at(format!("{prefix}/gpunodes"), get(watch::gpu_nodes))
        .at(format!("{prefix}/gpupods"), get(watch::gpu_pods))
        .at(INVENTORY_PATH, post(ingest::host_gpu_info))
        .at(ALLOCATIONS_PATH, post(ingest::pod_resources))
        .at(HEALTH_PATH, get(ingest::health))
        .data(state.scheduler)
        .data(state.ingest)
        .data(state.tracker)
        .data(state.index)
        .with(Tracing)
}

/// HTTP API of the central service.
pub struct ApiServer {
    state: ApiState,
    listen_addr: String,
}

impl ApiServer {
    pub fn new(state: ApiState, listen_addr: String) -> Self {
        Self { state, listen_addr }
    }

    /// Serves until cancelled.
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to start or bind to the address
    pub async fn run(self, cancellation_token: CancellationToken) -> Result<(), Report<ApiError>> {
        info!("Starting HTTP API server on {}", self.listen_addr);

        let app = routes(self.state);
        let listener = TcpListener::bind(&self.listen_addr);
        let server = Server::new(listener);

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("API server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        error!("API server failed: {e}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("Server failed: {e}"),
                        }))
                    }
                }
            }
            _ = cancellation_token.cancelled() => {
                info!("API server shutdown requested");
                Ok(())
            }
        }
    }
}
