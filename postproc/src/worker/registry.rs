//! Dynamic worker registry.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use super::Worker;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Registry change notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Added { title: String },
    Removed { title: String },
}

/// The set of currently available workers, keyed by title.
pub struct WorkerRegistry {
    workers: RwLock<Vec<Arc<dyn Worker>>>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            workers: RwLock::new(Vec::new()),
            event_tx,
        }
    }

    /// Add a worker, replacing any worker with the same title.
    pub fn register(&self, worker: Arc<dyn Worker>) {
        let title = worker.title().to_string();
        {
            let mut workers = self.workers.write();
            workers.retain(|existing| existing.title() != title);
            workers.push(worker);
        }
        info!(worker = %title, "Worker registered");
        let _ = self.event_tx.send(RegistryEvent::Added { title });
    }

    /// Remove the worker with `title`.
    pub fn deregister(&self, title: &str) -> Option<Arc<dyn Worker>> {
        let removed = {
            let mut workers = self.workers.write();
            let index = workers.iter().position(|w| w.title() == title)?;
            workers.remove(index)
        };
        info!(worker = %title, "Worker deregistered");
        let _ = self.event_tx.send(RegistryEvent::Removed {
            title: title.to_string(),
        });
        Some(removed)
    }

    pub fn get(&self, title: &str) -> Option<Arc<dyn Worker>> {
        self.workers
            .read()
            .iter()
            .find(|w| w.title() == title)
            .cloned()
    }

    pub fn contains(&self, title: &str) -> bool {
        self.get(title).is_some()
    }

    pub fn titles(&self) -> Vec<String> {
        self.workers
            .read()
            .iter()
            .map(|w| w.title().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    /// Subscribe to add/remove notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
