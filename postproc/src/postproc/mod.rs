//! The dual-lane post-processing scheduler.
//!
//! Work is split between a heavy lane (long jobs over whole media files, up to
//! a configured number at once) and a light lane (quick jobs, strictly one at
//! a time). Each lane has its own queue and poller; the two run independently.

mod lane;
mod queue;

pub use lane::{Lane, LaneKind, LaneStats, RetryState, TickOutcome};
pub use queue::{WorkKey, WorkQueue, WorkerRecording};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::PostProcConfig;
use crate::domain::{Recording, RecordingRule};
use crate::nms::RecordingStore;
use crate::worker::{RegistryEvent, WorkerRegistry};

/// Counters of both lanes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostProcStats {
    pub heavy: LaneStats,
    pub light: LaneStats,
}

pub struct PostProcessor {
    heavy: Arc<Lane>,
    light: Arc<Lane>,
    registry: Arc<WorkerRegistry>,
    store: Arc<dyn RecordingStore>,
    cancellation_token: CancellationToken,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl PostProcessor {
    pub fn new(
        config: &PostProcConfig,
        registry: Arc<WorkerRegistry>,
        store: Arc<dyn RecordingStore>,
    ) -> Self {
        let save_lock = Arc::new(tokio::sync::Mutex::new(()));
        Self {
            heavy: Arc::new(
                Lane::new(
                    LaneKind::Heavy,
                    &config.heavy_lane,
                    registry.clone(),
                    store.clone(),
                )
                .with_save_lock(save_lock.clone()),
            ),
            light: Arc::new(
                Lane::new(
                    LaneKind::Light,
                    &config.light_lane,
                    registry.clone(),
                    store.clone(),
                )
                .with_save_lock(save_lock),
            ),
            registry,
            store,
            cancellation_token: CancellationToken::new(),
            tasks: Mutex::new(Some(JoinSet::new())),
        }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn lane(&self, kind: LaneKind) -> &Arc<Lane> {
        match kind {
            LaneKind::Heavy => &self.heavy,
            LaneKind::Light => &self.light,
        }
    }

    /// Spawn both lane pollers and the registry watcher.
    ///
    /// Does nothing after [`stop`](Self::stop).
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!("Post-processor already stopped; not starting");
            return;
        };
        if !join_set.is_empty() {
            debug!("Post-processor already running");
            return;
        }

        info!("Starting post-processor");
        join_set.spawn(self.heavy.clone().run(self.cancellation_token.clone()));
        join_set.spawn(self.light.clone().run(self.cancellation_token.clone()));

        let mut events = self.registry.subscribe();
        let token = self.cancellation_token.clone();
        join_set.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(RegistryEvent::Added { title }) => {
                            info!(worker = %title, "Worker available");
                        }
                        Ok(RegistryEvent::Removed { title }) => {
                            info!(worker = %title, "Worker gone; its queued work will be skipped");
                        }
                        Err(RecvError::Lagged(missed)) => {
                            debug!(missed, "Registry watcher lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    /// Stop polling and cancel in-flight work.
    ///
    /// Queued items stay queued but are never dispatched.
    pub async fn stop(&self) {
        info!("Stopping post-processor");
        self.cancellation_token.cancel();

        let join_set = self.tasks.lock().take();
        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        let cancelled = self.heavy.cancel_in_flight() + self.light.cancel_in_flight();
        info!(cancelled, "Post-processor stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }

    /// Queue `item` in the lane its worker belongs to.
    ///
    /// Returns `None`, queueing nothing, when the worker is not registered.
    pub fn enqueue(&self, item: WorkerRecording) -> Option<LaneKind> {
        let worker = self.registry.get(&item.worker)?;
        let kind = if worker.is_heavy() {
            LaneKind::Heavy
        } else {
            LaneKind::Light
        };
        self.lane(kind).enqueue(item);
        Some(kind)
    }

    /// Queue every enabled task of `rule` that a registered worker performs.
    ///
    /// Returns how many items were queued. Tasks without a worker are skipped.
    pub fn schedule(&self, rule: &RecordingRule, recording: Arc<Recording>) -> usize {
        self.schedule_tasks(rule, recording, false)
    }

    /// Pull pending recordings from the store and queue their work.
    ///
    /// Work that is queued, in flight, or finished since start-up is not
    /// queued again, so repeated syncs never rerun a task. Use
    /// [`schedule`](Self::schedule) to run a task again on purpose.
    pub async fn sync_pending(&self) -> Result<usize> {
        let pending = self.store.pending().await?;
        let mut queued = 0;
        for (rule, recording) in pending {
            queued += self.schedule_tasks(&rule, Arc::new(recording), true);
        }
        debug!(queued, "Synchronised pending recordings");
        Ok(queued)
    }

    fn schedule_tasks(
        &self,
        rule: &RecordingRule,
        recording: Arc<Recording>,
        skip_known: bool,
    ) -> usize {
        let mut queued = 0;
        for title in rule.enabled_tasks() {
            if !self.registry.contains(title) {
                debug!(rule = %rule.id, worker = %title, "No worker for task; skipping");
                continue;
            }
            let item = WorkerRecording::new(title, recording.clone())
                .with_update_recording(rule.update_recording);
            if skip_known && self.is_known(&item.key()) {
                continue;
            }
            if let Some(kind) = self.enqueue(item) {
                debug!(rule = %rule.id, worker = %title, recording_id = %recording.id, lane = %kind, "Scheduled");
                queued += 1;
            }
        }
        queued
    }

    /// Whether an item for `key` waits in either lane.
    pub fn is_queued(&self, key: &WorkKey) -> bool {
        self.heavy.queue().contains(key) || self.light.queue().contains(key)
    }

    /// Whether work for `key` is queued, in flight, or finished in either lane.
    pub fn is_known(&self, key: &WorkKey) -> bool {
        self.is_queued(key)
            || [&self.heavy, &self.light]
                .iter()
                .any(|lane| lane.is_in_flight(key) || lane.has_finished(key))
    }

    pub fn stats(&self) -> PostProcStats {
        PostProcStats {
            heavy: self.heavy.stats(),
            light: self.light.stats(),
        }
    }
}

impl Drop for PostProcessor {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}
