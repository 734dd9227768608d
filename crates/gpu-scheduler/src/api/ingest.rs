//! Endpoints the node agents push to.

use std::sync::Arc;

use api_types::AllocationUpdate;
use api_types::NodeInventory;
use chrono::Utc;
use error_stack::Report;
use poem::error::ResponseError;
use poem::handler;
use poem::http::StatusCode;
use poem::web::Data;
use poem::web::Json;
use poem::web::Query;
use serde::Deserialize;
use tracing::debug;
use tracing::warn;

use super::errors::ApiError;
use crate::domain::index::ResourceIndex;
use crate::domain::liveness::NodeHealthTracker;
use crate::infrastructure::k8s::CrdStore;

/// Where pushed agent state ends up.
#[derive(Clone)]
pub enum IngestTarget {
    /// Straight into the in-process index.
    Memory(ResourceIndex),
    /// Into the persisted records, which the mirror feeds back to the index.
    Store(Arc<CrdStore>),
}

impl IngestTarget {
    async fn inventory(&self, inventory: NodeInventory) -> Result<(), Report<ApiError>> {
        match self {
            IngestTarget::Memory(index) => index
                .apply_inventory(inventory)
                .await
                .map_err(|e| e.change_context(ApiError::IndexUnavailable)),
            IngestTarget::Store(store) => store.apply_inventory(&inventory).await.map_err(|e| {
                let message = e.current_context().to_string();
                e.change_context(ApiError::StoreFailed {
                    what: "inventory",
                    message,
                })
            }),
        }
    }

    async fn allocations(&self, update: AllocationUpdate) -> Result<(), Report<ApiError>> {
        match self {
            IngestTarget::Memory(index) => index
                .apply_allocations(update)
                .await
                .map_err(|e| e.change_context(ApiError::IndexUnavailable)),
            IngestTarget::Store(store) => store.apply_allocations(&update).await.map_err(|e| {
                let message = e.current_context().to_string();
                e.change_context(ApiError::StoreFailed {
                    what: "allocations",
                    message,
                })
            }),
        }
    }
}

/// Inventory report. Always acknowledged: the agent resends on its next
/// model change or after reconnecting.
#[handler]
pub async fn host_gpu_info(
    target: Data<&IngestTarget>,
    Json(mut inventory): Json<NodeInventory>,
) -> StatusCode {
    if inventory.report_time.is_none() {
        inventory.report_time = Some(Utc::now());
    }
    let node_name = inventory.node_name.clone();
    debug!(node_name = %node_name, devices = inventory.devices.len(), "inventory received");
    if let Err(e) = target.inventory(inventory).await {
        warn!(node_name = %node_name, "failed to apply inventory: {e:?}");
    }
    StatusCode::OK
}

/// Allocation batch. Failures are reported so the agent retries.
#[handler]
pub async fn pod_resources(
    target: Data<&IngestTarget>,
    Json(update): Json<AllocationUpdate>,
) -> poem::Result<StatusCode> {
    let node_name = update.node_name.clone();
    debug!(
        node_name = %node_name,
        sync = update.sync.len(),
        delete = update.delete.len(),
        full_sync = update.full_sync,
        "allocations received"
    );
    target.allocations(update).await.map_err(|e| {
        warn!(node_name = %node_name, "failed to apply allocations: {e:?}");
        let error = e.current_context();
        poem::Error::from_string(error.to_string(), error.status())
    })?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    #[serde(default)]
    pub node: String,
}

/// Heartbeat of a node agent.
#[handler]
pub async fn health(
    tracker: Data<&Arc<NodeHealthTracker>>,
    Query(query): Query<HealthQuery>,
) -> StatusCode {
    if !query.node.is_empty() {
        tracker.heartbeat(&query.node).await;
    }
    StatusCode::OK
}
