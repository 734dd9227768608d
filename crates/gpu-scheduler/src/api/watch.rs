//! List and watch endpoints over the resource index.
//!
//! A plain GET returns the current objects as a JSON array. With
//! `?watch=true` the array is sent as the first line and every later change
//! follows as one `{"Type", "Object"}` line, until the client goes away or
//! the index shuts down.

use api_types::WatchEvent;
use async_stream::stream;
use poem::handler;
use poem::web::Data;
use poem::web::Json;
use poem::web::Query;
use poem::Body;
use poem::IntoResponse;
use poem::Response;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::errors::ApiError;
use crate::domain::index::IndexEvent;
use crate::domain::index::ResourceIndex;
use crate::domain::index::WatchKind;
use crate::infrastructure::k8s::GpuNode;
use crate::infrastructure::k8s::GpuPod;

#[derive(Debug, Default, Deserialize)]
pub struct WatchQuery {
    #[serde(default)]
    pub watch: bool,
}

/// Unregisters the watcher once the response body is dropped.
struct WatcherGuard {
    index: ResourceIndex,
    id: Uuid,
}

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        debug!(id = %self.id, "watch client gone");
        self.index.remove_watcher(self.id);
    }
}

fn to_value<T: serde::Serialize>(object: &T) -> Value {
    serde_json::to_value(object).unwrap_or_default()
}

fn render(event: &IndexEvent) -> WatchEvent<Value> {
    match event {
        IndexEvent::NodeSynced(view) => WatchEvent::synced(to_value(&GpuNode::from_view(view))),
        IndexEvent::NodeDeleted(view) => WatchEvent::deleted(to_value(&GpuNode::from_view(view))),
        IndexEvent::PodSynced(pod) => WatchEvent::synced(to_value(&GpuPod::from_allocation(pod))),
        IndexEvent::PodDeleted(pod) => {
            WatchEvent::deleted(to_value(&GpuPod::from_allocation(pod)))
        }
    }
}

fn line<T: serde::Serialize>(value: &T) -> Vec<u8> {
    let mut bytes = serde_json::to_vec(value).unwrap_or_default();
    bytes.push(b'\n');
    bytes
}

async fn list(index: &ResourceIndex, kind: WatchKind) -> poem::Result<Response> {
    let snapshot = index
        .snapshot()
        .await
        .map_err(|_| ApiError::IndexUnavailable)?;
    let objects: Vec<Value> = match kind {
        WatchKind::Nodes => snapshot
            .nodes
            .values()
            .map(|view| to_value(&GpuNode::from_view(view)))
            .collect(),
        WatchKind::Pods => snapshot
            .pods
            .values()
            .map(|pod| to_value(&GpuPod::from_allocation(pod)))
            .collect(),
    };
    Ok(Json(objects).into_response())
}

async fn watch(index: &ResourceIndex, kind: WatchKind) -> poem::Result<Response> {
    let (id, initial, mut events) = index
        .add_watcher(kind)
        .await
        .map_err(|_| ApiError::IndexUnavailable)?;
    debug!(%id, ?kind, "watch client registered");
    let guard = WatcherGuard {
        index: index.clone(),
        id,
    };
    let objects: Vec<Value> = initial.iter().map(|event| render(event).object).collect();

    let body = stream! {
        let _guard = guard;
        yield Ok::<_, std::io::Error>(line(&objects));
        while let Some(event) = events.recv().await {
            yield Ok(line(&render(&event)));
        }
    };

    Ok(Response::builder()
        .content_type("application/x-ndjson")
        .body(Body::from_bytes_stream(body)))
}

async fn serve(index: &ResourceIndex, kind: WatchKind, query: WatchQuery) -> poem::Result<Response> {
    if query.watch {
        watch(index, kind).await
    } else {
        list(index, kind).await
    }
}

#[handler]
pub async fn gpu_nodes(
    index: Data<&ResourceIndex>,
    Query(query): Query<WatchQuery>,
) -> poem::Result<Response> {
    serve(&index, WatchKind::Nodes, query).await
}

#[handler]
pub async fn gpu_pods(
    index: Data<&ResourceIndex>,
    Query(query): Query<WatchQuery>,
) -> poem::Result<Response> {
    serve(&index, WatchKind::Pods, query).await
}
