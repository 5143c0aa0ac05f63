//! One scheduling lane: a queue, its poller and its in-flight counter.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::queue::{WorkKey, WorkQueue, WorkerRecording};
use crate::config::LaneConfig;
use crate::domain::Recording;
use crate::job::{JobEvent, JobEventKind, JobListener};
use crate::nms::RecordingStore;
use crate::worker::{Worker, WorkerRegistry};

/// Which lane an item runs in, decided by [`Worker::is_heavy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaneKind {
    /// Long-running work over the whole media file.
    Heavy,
    /// Quick work; never more than one item at a time.
    Light,
}

impl fmt::Display for LaneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaneKind::Heavy => write!(f, "heavy"),
            LaneKind::Light => write!(f, "light"),
        }
    }
}

/// Tracks the single item being retried at the head of the queue.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RetryState {
    #[default]
    Idle,
    Retrying { key: WorkKey, count: u32 },
}

/// What one poller tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The lane is at its in-flight limit.
    NotReady,
    Empty,
    Dispatched,
    /// The worker is no longer registered; the item was dropped.
    Skipped,
    /// Media not present yet; the item went back to the head of the queue.
    Requeued { attempt: u32 },
    /// Media still missing after the retry budget; the item was dropped.
    Abandoned,
}

/// Point-in-time counters of a lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneStats {
    pub kind: LaneKind,
    pub queued: usize,
    pub in_flight: usize,
    pub max_jobs: usize,
    pub dispatched: u64,
    pub completed: u64,
    pub skipped: u64,
    pub abandoned: u64,
}

struct Dispatch {
    key: WorkKey,
    worker: Arc<dyn Worker>,
    recording: Arc<Recording>,
}

pub struct Lane {
    kind: LaneKind,
    queue: WorkQueue,
    max_jobs: usize,
    max_retries: u32,
    poll_interval: Duration,
    /// Incremented by the poller, decremented by completion listeners.
    in_flight: AtomicUsize,
    retry: Mutex<RetryState>,
    active: Mutex<HashMap<Uuid, Dispatch>>,
    /// Keys whose work completed since start-up.
    finished: Mutex<HashSet<WorkKey>>,
    registry: Arc<WorkerRegistry>,
    store: Arc<dyn RecordingStore>,
    /// Held across each read-modify-write of a recording.
    save_lock: Arc<tokio::sync::Mutex<()>>,
    dispatched: AtomicU64,
    completed: AtomicU64,
    skipped: AtomicU64,
    abandoned: AtomicU64,
}

impl Lane {
    /// The light lane always runs one item at a time, whatever `config` says.
    pub fn new(
        kind: LaneKind,
        config: &LaneConfig,
        registry: Arc<WorkerRegistry>,
        store: Arc<dyn RecordingStore>,
    ) -> Self {
        let max_jobs = match kind {
            LaneKind::Heavy => config.max_jobs.max(1),
            LaneKind::Light => 1,
        };
        Self {
            kind,
            queue: WorkQueue::new(),
            max_jobs,
            max_retries: config.max_retries,
            poll_interval: config.poll_interval(),
            in_flight: AtomicUsize::new(0),
            retry: Mutex::new(RetryState::Idle),
            active: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashSet::new()),
            registry,
            store,
            save_lock: Arc::new(tokio::sync::Mutex::new(())),
            dispatched: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        }
    }

    /// Share recording saves with another lane so their updates never interleave.
    pub fn with_save_lock(mut self, save_lock: Arc<tokio::sync::Mutex<()>>) -> Self {
        self.save_lock = save_lock;
        self
    }

    pub fn kind(&self) -> LaneKind {
        self.kind
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn enqueue(&self, item: WorkerRecording) {
        debug!(lane = %self.kind, item = %item, "Queued");
        self.queue.push_back(item);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Whether another item may be dispatched.
    pub fn is_ready(&self) -> bool {
        self.in_flight() < self.max_jobs
    }

    /// Whether work for `key` has been dispatched and not yet completed.
    pub fn is_in_flight(&self, key: &WorkKey) -> bool {
        self.active.lock().values().any(|d| d.key == *key)
    }

    /// Whether work for `key` completed in this lane since start-up.
    pub fn has_finished(&self, key: &WorkKey) -> bool {
        self.finished.lock().contains(key)
    }

    pub fn retry_state(&self) -> RetryState {
        self.retry.lock().clone()
    }

    pub fn stats(&self) -> LaneStats {
        LaneStats {
            kind: self.kind,
            queued: self.queue.len(),
            in_flight: self.in_flight(),
            max_jobs: self.max_jobs,
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }

    /// Run one poller step.
    ///
    /// Only the head of the queue is ever examined. An item whose media is
    /// missing goes back to the head, so it holds up the items behind it
    /// until its media appears or its retry budget runs out. An item whose
    /// worker has left the registry is dropped without waiting for media.
    pub async fn tick(self: &Arc<Self>) -> TickOutcome {
        if !self.is_ready() {
            return TickOutcome::NotReady;
        }
        let Some(item) = self.queue.pop_front() else {
            return TickOutcome::Empty;
        };
        let Some(worker) = self.registry.get(&item.worker) else {
            return self.skip(item);
        };

        if item.recording.media_present().await {
            *self.retry.lock() = RetryState::Idle;
            self.dispatch(item, worker)
        } else {
            self.requeue(item)
        }
    }

    fn skip(&self, item: WorkerRecording) -> TickOutcome {
        let key = item.key();
        let mut retry = self.retry.lock();
        if matches!(&*retry, RetryState::Retrying { key: target, .. } if *target == key) {
            *retry = RetryState::Idle;
        }
        drop(retry);
        self.skipped.fetch_add(1, Ordering::Relaxed);
        debug!(lane = %self.kind, item = %item, "Worker no longer registered; skipping");
        TickOutcome::Skipped
    }

    fn requeue(&self, item: WorkerRecording) -> TickOutcome {
        let key = item.key();
        let mut retry = self.retry.lock();
        let attempt = match &*retry {
            RetryState::Retrying { key: target, count } if *target == key => count + 1,
            _ => 1,
        };

        if attempt >= self.max_retries {
            *retry = RetryState::Idle;
            drop(retry);
            self.abandoned.fetch_add(1, Ordering::Relaxed);
            warn!(
                lane = %self.kind,
                item = %item,
                path = %item.recording.path.display(),
                attempts = attempt,
                "Media never appeared; abandoning"
            );
            return TickOutcome::Abandoned;
        }

        *retry = RetryState::Retrying { key, count: attempt };
        drop(retry);
        debug!(lane = %self.kind, item = %item, attempt, "Media not present yet; retrying at head");
        self.queue.push_front(item);
        TickOutcome::Requeued { attempt }
    }

    fn dispatch(self: &Arc<Self>, item: WorkerRecording, worker: Arc<dyn Worker>) -> TickOutcome {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.active.lock().insert(
            item.id,
            Dispatch {
                key: item.key(),
                worker: worker.clone(),
                recording: item.recording.clone(),
            },
        );

        let listener = Arc::new(DispatchListener {
            lane: Arc::downgrade(self),
            id: item.id,
            key: item.key(),
            label: item.to_string(),
            recording: item.recording.clone(),
            update_recording: item.update_recording,
            fired: AtomicBool::new(false),
            handle: Handle::current(),
        });

        info!(lane = %self.kind, item = %item, in_flight = self.in_flight(), "Dispatching");
        let recording = item.recording.clone();
        let for_worker: Arc<dyn JobListener> = listener.clone();
        if catch_unwind(AssertUnwindSafe(|| worker.work(recording, for_worker))).is_err() {
            error!(lane = %self.kind, item = %item, "Worker panicked while starting; treating as complete");
            listener.finish(None);
        }
        TickOutcome::Dispatched
    }

    /// Ask every worker with an item in flight to cancel it.
    pub fn cancel_in_flight(&self) -> usize {
        let dispatches: Vec<(Arc<dyn Worker>, Arc<Recording>)> = self
            .active
            .lock()
            .values()
            .map(|d| (d.worker.clone(), d.recording.clone()))
            .collect();
        for (worker, recording) in &dispatches {
            info!(lane = %self.kind, worker = %worker.title(), recording_id = %recording.id, "Cancelling in-flight work");
            worker.cancel(recording);
        }
        dispatches.len()
    }

    /// Poll until `token` is cancelled.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(
            lane = %self.kind,
            max_jobs = self.max_jobs,
            poll_interval = ?self.poll_interval,
            "Lane poller started"
        );
        loop {
            if token.is_cancelled() {
                break;
            }
            let outcome = self.tick().await;
            if !matches!(outcome, TickOutcome::Empty | TickOutcome::NotReady) {
                debug!(lane = %self.kind, ?outcome, "Tick");
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!(lane = %self.kind, "Lane poller stopped");
    }

    /// Persist a recording after its worker signalled an update.
    ///
    /// The store's current copy is read back and only the fields `updated`
    /// changed relative to `dispatched` are written over it.
    fn save_recording(
        &self,
        handle: &Handle,
        dispatched: Arc<Recording>,
        updated: Option<Arc<Recording>>,
    ) {
        let store = self.store.clone();
        let save_lock = self.save_lock.clone();
        let kind = self.kind;
        handle.spawn(async move {
            let id = &dispatched.id;
            let _guard = save_lock.lock().await;
            let mut current = match store.recording(id).await {
                Ok(Some(current)) => current,
                Ok(None) => {
                    warn!(lane = %kind, recording_id = %id, "Recording no longer in store; update dropped");
                    return;
                }
                Err(e) => {
                    warn!(lane = %kind, recording_id = %id, error = %e, "Failed to load recording for update");
                    return;
                }
            };
            if let Some(updated) = &updated {
                current.apply_changes(&dispatched, updated);
            }
            match store.save(&current).await {
                Ok(()) => debug!(lane = %kind, recording_id = %id, "Recording updated"),
                Err(e) => warn!(lane = %kind, recording_id = %id, error = %e, "Failed to save recording"),
            }
        });
    }
}

impl fmt::Debug for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lane")
            .field("kind", &self.kind)
            .field("max_jobs", &self.max_jobs)
            .field("in_flight", &self.in_flight())
            .field("queued", &self.queue.len())
            .finish()
    }
}

/// Listener handed to a worker for one dispatched item.
struct DispatchListener {
    lane: Weak<Lane>,
    id: Uuid,
    key: WorkKey,
    label: String,
    recording: Arc<Recording>,
    update_recording: bool,
    /// Set by the first `Complete`; later ones are ignored.
    fired: AtomicBool,
    handle: Handle,
}

impl DispatchListener {
    fn finish(&self, updated: Option<Arc<Recording>>) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(lane) = self.lane.upgrade() else {
            return;
        };

        let _ = lane
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
        lane.completed.fetch_add(1, Ordering::Relaxed);
        lane.active.lock().remove(&self.id);
        lane.finished.lock().insert(self.key.clone());
        if lane.kind == LaneKind::Light {
            *lane.retry.lock() = RetryState::Idle;
        }
        info!(lane = %lane.kind, item = %self.label, in_flight = lane.in_flight(), "Work complete");

        if self.update_recording {
            lane.save_recording(&self.handle, self.recording.clone(), updated);
        }
    }
}

impl JobListener for DispatchListener {
    fn on_job_event(&self, event: &JobEvent) {
        match event.kind {
            JobEventKind::Complete => self.finish(event.recording.clone()),
            JobEventKind::Updated => {
                if let Some(lane) = self.lane.upgrade() {
                    lane.save_recording(&self.handle, self.recording.clone(), event.recording.clone());
                }
            }
            JobEventKind::Failed => {
                warn!(item = %self.label, message = ?event.message, "Worker reported failure");
            }
            JobEventKind::Message => {
                debug!(item = %self.label, message = ?event.message, "Worker message");
            }
        }
    }
}
