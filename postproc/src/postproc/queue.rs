//! Locked FIFO of queued work.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::Recording;

/// A worker paired with the recording it will process.
///
/// The worker is referenced by title and looked up again at dispatch time, so
/// a worker that leaves the registry while the item waits is simply skipped.
#[derive(Debug, Clone)]
pub struct WorkerRecording {
    pub id: Uuid,
    pub worker: String,
    pub recording: Arc<Recording>,
    /// Persist the recording when the worker completes.
    pub update_recording: bool,
    pub enqueued_at: DateTime<Utc>,
}

impl WorkerRecording {
    pub fn new(worker: impl Into<String>, recording: Arc<Recording>) -> Self {
        Self {
            id: Uuid::new_v4(),
            worker: worker.into(),
            recording,
            update_recording: false,
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_update_recording(mut self, update: bool) -> Self {
        self.update_recording = update;
        self
    }

    /// Identity used for retry tracking and duplicate detection.
    pub fn key(&self) -> WorkKey {
        WorkKey {
            worker: self.worker.clone(),
            recording_id: self.recording.id.clone(),
        }
    }
}

impl fmt::Display for WorkerRecording {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.worker, self.recording.id)
    }
}

/// (worker title, recording id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkKey {
    pub worker: String,
    pub recording_id: String,
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.worker, self.recording_id)
    }
}

/// FIFO of [`WorkerRecording`]s; every operation takes the lock once.
#[derive(Debug, Default)]
pub struct WorkQueue {
    items: Mutex<VecDeque<WorkerRecording>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&self, item: WorkerRecording) {
        self.items.lock().push_back(item);
    }

    /// Put an item back at the head, ahead of everything else.
    pub fn push_front(&self, item: WorkerRecording) {
        self.items.lock().push_front(item);
    }

    pub fn pop_front(&self) -> Option<WorkerRecording> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn contains(&self, key: &WorkKey) -> bool {
        self.items.lock().iter().any(|item| {
            item.worker == key.worker && item.recording.id == key.recording_id
        })
    }

    /// Drop every queued item, returning how many were removed.
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let removed = items.len();
        items.clear();
        removed
    }

    /// Snapshot of queued keys in order.
    pub fn keys(&self) -> Vec<WorkKey> {
        self.items.lock().iter().map(WorkerRecording::key).collect()
    }
}
