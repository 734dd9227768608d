//! Central resource index.
//!
//! All state lives in [`IndexState`], owned by a single actor task. The
//! cloneable [`ResourceIndex`] handle sends commands over a channel and waits
//! for the reply, so reads observe every write sent before them.

mod state;
mod watchers;

use std::collections::BTreeSet;

use api_types::AllocationUpdate;
use api_types::NodeInventory;
use api_types::PodAllocation;
use api_types::PodKey;
use error_stack::Report;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use uuid::Uuid;

pub use state::ClusterSnapshot;
pub use state::IndexEvent;
pub use state::IndexState;
pub use state::NodeRecord;
pub use state::NodeView;
pub use watchers::WatchKind;
use watchers::WatcherRegistry;

use crate::domain::liveness::NodeHealth;

#[derive(Debug, derive_more::Display)]
pub enum IndexError {
    #[display("resource index is not running")]
    Stopped,
}

impl core::error::Error for IndexError {}

enum Mutation {
    Inventory(NodeInventory),
    Allocations(AllocationUpdate),
    Health(NodeHealth),
    SyncNode(NodeRecord),
    RemoveNode(String),
    ReplaceNodes(Vec<NodeRecord>),
    UpsertPod(PodAllocation),
    RemovePod(PodKey),
    ReplacePods(Vec<PodAllocation>),
}

enum Command {
    Mutate(Mutation, oneshot::Sender<()>),
    Snapshot(oneshot::Sender<ClusterSnapshot>),
    Busy(String, oneshot::Sender<BTreeSet<String>>),
    Free(String, String, oneshot::Sender<BTreeSet<String>>),
    AddWatcher(
        WatchKind,
        oneshot::Sender<(Uuid, Vec<IndexEvent>, mpsc::Receiver<IndexEvent>)>,
    ),
    RemoveWatcher(Uuid),
}

/// Handle to the index actor.
#[derive(Clone)]
pub struct ResourceIndex {
    commands: mpsc::Sender<Command>,
}

/// The task owning the index state. Drive it with [`IndexActor::run`].
pub struct IndexActor {
    commands: mpsc::Receiver<Command>,
    state: IndexState,
    watchers: WatcherRegistry,
}

impl ResourceIndex {
    pub fn new(watcher_capacity: usize) -> (Self, IndexActor) {
        let (tx, rx) = mpsc::channel(1024);
        (
            Self { commands: tx },
            IndexActor {
                commands: rx,
                state: IndexState::default(),
                watchers: WatcherRegistry::new(watcher_capacity),
            },
        )
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, Report<IndexError>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| Report::new(IndexError::Stopped))?;
        rx.await.map_err(|_| Report::new(IndexError::Stopped))
    }

    async fn mutate(&self, mutation: Mutation) -> Result<(), Report<IndexError>> {
        self.request(|tx| Command::Mutate(mutation, tx)).await
    }

    pub async fn apply_inventory(&self, inventory: NodeInventory) -> Result<(), Report<IndexError>> {
        self.mutate(Mutation::Inventory(inventory)).await
    }

    pub async fn apply_allocations(
        &self,
        update: AllocationUpdate,
    ) -> Result<(), Report<IndexError>> {
        self.mutate(Mutation::Allocations(update)).await
    }

    pub async fn set_health(&self, health: NodeHealth) -> Result<(), Report<IndexError>> {
        self.mutate(Mutation::Health(health)).await
    }

    pub async fn sync_node(&self, record: NodeRecord) -> Result<(), Report<IndexError>> {
        self.mutate(Mutation::SyncNode(record)).await
    }

    pub async fn remove_node(&self, name: String) -> Result<(), Report<IndexError>> {
        self.mutate(Mutation::RemoveNode(name)).await
    }

    pub async fn replace_nodes(&self, records: Vec<NodeRecord>) -> Result<(), Report<IndexError>> {
        self.mutate(Mutation::ReplaceNodes(records)).await
    }

    pub async fn upsert_pod(&self, allocation: PodAllocation) -> Result<(), Report<IndexError>> {
        self.mutate(Mutation::UpsertPod(allocation)).await
    }

    pub async fn remove_pod(&self, key: PodKey) -> Result<(), Report<IndexError>> {
        self.mutate(Mutation::RemovePod(key)).await
    }

    pub async fn replace_pods(
        &self,
        allocations: Vec<PodAllocation>,
    ) -> Result<(), Report<IndexError>> {
        self.mutate(Mutation::ReplacePods(allocations)).await
    }

    pub async fn snapshot(&self) -> Result<ClusterSnapshot, Report<IndexError>> {
        self.request(Command::Snapshot).await
    }

    pub async fn busy_devices(&self, node_name: &str) -> Result<BTreeSet<String>, Report<IndexError>> {
        let node_name = node_name.to_string();
        self.request(|tx| Command::Busy(node_name, tx)).await
    }

    /// `model` must already be normalized.
    pub async fn free_devices(
        &self,
        node_name: &str,
        model: &str,
    ) -> Result<BTreeSet<String>, Report<IndexError>> {
        let (node_name, model) = (node_name.to_string(), model.to_string());
        self.request(|tx| Command::Free(node_name, model, tx)).await
    }

    /// Registers a watcher.
    ///
    /// Returns the current objects of `kind` as synced events, followed on
    /// the receiver by every later change. Registration and listing happen
    /// in the same actor step so no change falls between them.
    pub async fn add_watcher(
        &self,
        kind: WatchKind,
    ) -> Result<(Uuid, Vec<IndexEvent>, mpsc::Receiver<IndexEvent>), Report<IndexError>> {
        self.request(|tx| Command::AddWatcher(kind, tx)).await
    }

    /// Fire and forget, usable from `Drop`.
    pub fn remove_watcher(&self, id: Uuid) {
        if let Err(e) = self.commands.try_send(Command::RemoveWatcher(id)) {
            debug!(%id, "could not unregister watcher: {e}");
        }
    }
}

impl IndexActor {
    fn apply(&mut self, mutation: Mutation) -> Vec<IndexEvent> {
        let state = &mut self.state;
        match mutation {
            Mutation::Inventory(inventory) => state.apply_inventory(inventory),
            Mutation::Allocations(update) => state.apply_allocations(update),
            Mutation::Health(health) => state.set_health(health),
            Mutation::SyncNode(record) => state.sync_node(record),
            Mutation::RemoveNode(name) => state.remove_node(&name),
            Mutation::ReplaceNodes(records) => state.replace_nodes(records),
            Mutation::UpsertPod(allocation) => state.upsert_pod(allocation),
            Mutation::RemovePod(key) => state.remove_pod(&key),
            Mutation::ReplacePods(allocations) => state.replace_pods(allocations),
        }
    }

    fn current(&self, kind: WatchKind) -> Vec<IndexEvent> {
        match kind {
            WatchKind::Nodes => self
                .state
                .nodes()
                .cloned()
                .map(IndexEvent::NodeSynced)
                .collect(),
            WatchKind::Pods => self
                .state
                .pods()
                .cloned()
                .map(IndexEvent::PodSynced)
                .collect(),
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Mutate(mutation, reply) => {
                for event in self.apply(mutation) {
                    self.watchers.notify(&event);
                }
                let _ = reply.send(());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.state.snapshot());
            }
            Command::Busy(node_name, reply) => {
                let _ = reply.send(self.state.busy(&node_name));
            }
            Command::Free(node_name, model, reply) => {
                let _ = reply.send(self.state.free(&node_name, &model));
            }
            Command::AddWatcher(kind, reply) => {
                let current = self.current(kind);
                let (id, receiver) = self.watchers.add(kind);
                if reply.send((id, current, receiver)).is_err() {
                    self.watchers.remove(&id);
                }
            }
            Command::RemoveWatcher(id) => {
                if self.watchers.remove(&id) {
                    debug!(%id, remaining = self.watchers.len(), "watcher unregistered");
                }
            }
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(mut self, cancellation_token: CancellationToken) {
        info!("Starting resource index");
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Resource index shutdown requested");
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }
        // closes every watch stream
        self.watchers.clear();
    }
}
