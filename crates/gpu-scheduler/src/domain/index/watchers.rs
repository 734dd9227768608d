use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;
use uuid::Uuid;

use super::IndexEvent;

/// Which record kind a watcher is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    Nodes,
    Pods,
}

impl IndexEvent {
    pub fn kind(&self) -> WatchKind {
        match self {
            IndexEvent::NodeSynced(_) | IndexEvent::NodeDeleted(_) => WatchKind::Nodes,
            IndexEvent::PodSynced(_) | IndexEvent::PodDeleted(_) => WatchKind::Pods,
        }
    }
}

struct Watcher {
    kind: WatchKind,
    sender: mpsc::Sender<IndexEvent>,
}

/// Registered change listeners, keyed by id.
pub(super) struct WatcherRegistry {
    capacity: usize,
    watchers: HashMap<Uuid, Watcher>,
}

impl WatcherRegistry {
    pub(super) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            watchers: HashMap::new(),
        }
    }

    pub(super) fn add(&mut self, kind: WatchKind) -> (Uuid, mpsc::Receiver<IndexEvent>) {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.watchers.insert(id, Watcher { kind, sender });
        debug!(%id, ?kind, "watcher registered");
        (id, receiver)
    }

    pub(super) fn remove(&mut self, id: &Uuid) -> bool {
        self.watchers.remove(id).is_some()
    }

    /// Best effort delivery: a full watcher misses this event, a closed one
    /// is dropped from the registry.
    pub(super) fn notify(&mut self, event: &IndexEvent) {
        let kind = event.kind();
        self.watchers.retain(|id, watcher| {
            if watcher.kind != kind {
                return true;
            }
            match watcher.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!(%id, "watcher channel full, event skipped");
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(%id, "watcher gone");
                    false
                }
            }
        });
    }

    /// Closes every watcher stream.
    pub(super) fn clear(&mut self) {
        self.watchers.clear();
    }

    pub(super) fn len(&self) -> usize {
        self.watchers.len()
    }
}
