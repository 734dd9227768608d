//! HTTP client the node agent uses to reach the central service.

use std::time::Duration;

use api_types::AllocationUpdate;
use api_types::NodeInventory;
use async_trait::async_trait;
use error_stack::Report;
use reqwest::Client;
use reqwest::Response;
use serde::Serialize;
use tracing::debug;

use crate::domain::allocation::AllocationPublisher;
use crate::domain::allocation::PushError;
use crate::domain::liveness::HealthProbe;
use crate::domain::liveness::ProbeError;

pub const INVENTORY_PATH: &str = "/hostgpuinfo";
pub const ALLOCATIONS_PATH: &str = "/podresources";
pub const HEALTH_PATH: &str = "/health";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Pushes agent state to the central service and probes its liveness.
#[derive(Clone)]
pub struct ServerClient {
    http: Client,
    base_url: String,
    node_name: String,
}

impl ServerClient {
    /// # Errors
    ///
    /// - [`PushError::Transport`] if the HTTP client cannot be built
    pub fn new(
        base_url: impl Into<String>,
        node_name: impl Into<String>,
    ) -> Result<Self, Report<PushError>> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PushError::Transport {
                message: format!("Failed to create HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            node_name: node_name.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<(), Report<PushError>> {
        let response = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| PushError::Transport {
                message: format!("POST {path}: {e}"),
            })?;
        check_status(response, path)
    }
}

fn check_status(response: Response, path: &str) -> Result<(), Report<PushError>> {
    let status = response.status();
    if status.is_success() {
        debug!(path, %status, "push accepted");
        return Ok(());
    }
    Err(Report::new(PushError::Rejected {
        status: status.as_u16(),
    })
    .attach_printable(format!("POST {path}")))
}

#[async_trait]
impl AllocationPublisher for ServerClient {
    async fn publish_inventory(&self, inventory: &NodeInventory) -> Result<(), Report<PushError>> {
        self.post_json(INVENTORY_PATH, inventory).await
    }

    async fn publish_allocations(
        &self,
        update: &AllocationUpdate,
    ) -> Result<(), Report<PushError>> {
        self.post_json(ALLOCATIONS_PATH, update).await
    }
}

#[async_trait]
impl HealthProbe for ServerClient {
    async fn probe(&self) -> Result<(), Report<ProbeError>> {
        let response = self
            .http
            .get(self.url(HEALTH_PATH))
            .query(&[("node", self.node_name.as_str())])
            .send()
            .await
            .map_err(|e| ProbeError::Unreachable {
                message: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Report::new(ProbeError::BadStatus {
                status: status.as_u16(),
            }))
        }
    }
}
