//! Job events and listener bookkeeping.

use parking_lot::RwLock;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

use super::JobState;
use crate::domain::Recording;

/// Kind of a [`JobEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobEventKind {
    /// Free-form progress message.
    Message,
    /// The job changed fields of the entity it works on; persist them.
    Updated,
    /// The job gave up; a `Complete` event still follows.
    Failed,
    /// The job finished. Carries no payload; read results from the job itself.
    Complete,
}

impl fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobEventKind::Message => write!(f, "message"),
            JobEventKind::Updated => write!(f, "updated"),
            JobEventKind::Failed => write!(f, "failed"),
            JobEventKind::Complete => write!(f, "complete"),
        }
    }
}

/// An event fired by a job to its listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub kind: JobEventKind,
    /// Name of the job that fired the event.
    pub source: String,
    pub message: Option<String>,
    pub state: Option<JobState>,
    /// The entity as the job left it, on `Updated` and `Complete`.
    pub recording: Option<Arc<Recording>>,
}

impl JobEvent {
    pub fn new(kind: JobEventKind, source: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            message: None,
            state: None,
            recording: None,
        }
    }

    pub fn complete(source: impl Into<String>) -> Self {
        Self::new(JobEventKind::Complete, source)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    /// Attach the recording with the fields the job changed.
    pub fn with_recording(mut self, recording: Arc<Recording>) -> Self {
        self.recording = Some(recording);
        self
    }

    pub fn is_complete(&self) -> bool {
        self.kind == JobEventKind::Complete
    }
}

/// Receives events fired by a job.
///
/// Listeners run synchronously on the firing task; a listener that blocks
/// blocks the job.
pub trait JobListener: Send + Sync {
    fn on_job_event(&self, event: &JobEvent);
}

impl<F> JobListener for F
where
    F: Fn(&JobEvent) + Send + Sync,
{
    fn on_job_event(&self, event: &JobEvent) {
        self(event)
    }
}

/// Handle returned by [`ListenerSet::add`], used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// An ordered set of listeners.
#[derive(Default)]
pub struct ListenerSet {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn JobListener>)>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn JobListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Returns `false` if the listener was already removed.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Deliver `event` to every listener in insertion order.
    ///
    /// The set is snapshotted first, so listeners may add or remove listeners
    /// (including themselves) while being notified. A panicking listener is
    /// logged and skipped.
    pub fn fire(&self, event: &JobEvent) {
        let snapshot: Vec<Arc<dyn JobListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener.on_job_event(event))).is_err() {
                error!(
                    source = %event.source,
                    kind = %event.kind,
                    "Job listener panicked while handling event"
                );
            }
        }
    }
}

impl fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Arc<dyn JobListener> {
        let log = log.clone();
        Arc::new(move |event: &JobEvent| {
            log.lock().push(format!("{}:{}", name, event.kind));
        })
    }

    #[test]
    fn test_fire_in_insertion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let set = ListenerSet::new();
        set.add(recorder(&log, "a"));
        set.add(recorder(&log, "b"));
        set.add(recorder(&log, "c"));

        set.fire(&JobEvent::complete("job"));

        assert_eq!(*log.lock(), vec!["a:complete", "b:complete", "c:complete"]);
    }

    #[test]
    fn test_remove_listener() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let set = ListenerSet::new();
        let a = set.add(recorder(&log, "a"));
        set.add(recorder(&log, "b"));

        assert!(set.remove(a));
        assert!(!set.remove(a));
        set.fire(&JobEvent::new(JobEventKind::Message, "job"));

        assert_eq!(*log.lock(), vec!["b:message"]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let set = ListenerSet::new();
        set.add(Arc::new(|_: &JobEvent| panic!("listener bug")));
        set.add(recorder(&log, "after"));

        set.fire(&JobEvent::complete("job"));

        assert_eq!(*log.lock(), vec!["after:complete"]);
    }

    #[test]
    fn test_listener_can_remove_itself() {
        let set = Arc::new(ListenerSet::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let set_ref = Arc::downgrade(&set);
        let slot_ref = slot.clone();
        let id = set.add(Arc::new(move |_: &JobEvent| {
            if let (Some(set), Some(id)) = (set_ref.upgrade(), *slot_ref.lock()) {
                set.remove(id);
            }
        }));
        *slot.lock() = Some(id);

        set.fire(&JobEvent::complete("job"));
        assert!(set.is_empty());
    }

    #[test]
    fn test_event_builders() {
        let event = JobEvent::new(JobEventKind::Failed, "transfer")
            .with_message("gave up")
            .with_state(JobState::Terminating);
        assert_eq!(event.message.as_deref(), Some("gave up"));
        assert_eq!(event.state, Some(JobState::Terminating));
        assert!(!event.is_complete());
    }
}
