//! Container running a single job on its own task.

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{Job, JobContext, JobListener, JobState, ListenerId, ListenerSet};

/// Scheduling hint for a container.
///
/// Tokio has no task priorities; the value is recorded for callers that order
/// work by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum JobPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

impl JobPriority {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => JobPriority::Low,
            2 => JobPriority::High,
            _ => JobPriority::Normal,
        }
    }
}

/// Owns one job for its whole life and runs it on a dedicated task.
///
/// A container is single-use: once started (or stopped) it cannot be started
/// again. Dropping the container raises the job's termination flag.
pub struct JobContainer {
    job: Arc<dyn Job>,
    ctx: JobContext,
    state: Arc<watch::Sender<JobState>>,
    priority: AtomicU8,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobContainer {
    pub fn new(job: Arc<dyn Job>) -> Self {
        let ctx = JobContext::new(
            job.name(),
            CancellationToken::new(),
            job.poll_interval(),
            Arc::new(ListenerSet::new()),
        );
        let (state, _) = watch::channel(JobState::Created);

        Self {
            job,
            ctx,
            state: Arc::new(state),
            priority: AtomicU8::new(JobPriority::Normal as u8),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    pub fn job(&self) -> &Arc<dyn Job> {
        &self.job
    }

    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    pub fn is_terminate(&self) -> bool {
        self.ctx.is_terminate()
    }

    pub fn is_completed(&self) -> bool {
        self.state() == JobState::Completed
    }

    pub fn priority(&self) -> JobPriority {
        JobPriority::from_u8(self.priority.load(Ordering::Relaxed))
    }

    pub fn set_priority(&self, priority: JobPriority) {
        self.priority.store(priority as u8, Ordering::Relaxed);
    }

    /// Register a listener for the job's events.
    ///
    /// Register before [`start`](Self::start) to be sure to see every event.
    pub fn add_listener(&self, listener: Arc<dyn JobListener>) -> ListenerId {
        self.ctx.listeners().add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.ctx.listeners().remove(id)
    }

    /// Spawn the job's `run` body.
    ///
    /// Returns `false` if the container was already started or stopped.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let started = self.state.send_if_modified(|state| {
            if *state == JobState::Created {
                *state = JobState::Started;
                true
            } else {
                false
            }
        });
        if !started {
            warn!(job = %self.name(), state = %self.state(), "Job container cannot be restarted");
            return false;
        }

        let job = self.job.clone();
        let ctx = self.ctx.clone();
        let state = self.state.clone();

        let handle = tokio::spawn(async move {
            state.send_if_modified(|s| {
                if *s == JobState::Started {
                    *s = JobState::Running;
                    true
                } else {
                    false
                }
            });
            debug!(job = %ctx.name(), "Job running");

            match AssertUnwindSafe(job.run(&ctx)).catch_unwind().await {
                Ok(Ok(())) => debug!(job = %ctx.name(), "Job finished"),
                Ok(Err(e)) => warn!(job = %ctx.name(), error = %e, "Job stopped with error"),
                Err(_) => error!(job = %ctx.name(), "Job panicked; treating it as stopped"),
            }

            ctx.token().cancel();
            ctx.listeners().clear();
            state.send_replace(JobState::Completed);
        });

        *self.handle.lock() = Some(handle);
        true
    }

    /// Raise the termination flag.
    ///
    /// The job finishes at its next check of the flag. Calling `stop` more
    /// than once is harmless. A container stopped before it was started goes
    /// straight to `Completed`.
    pub fn stop(&self) {
        self.ctx.token().cancel();
        self.state.send_if_modified(|state| match *state {
            JobState::Created => {
                *state = JobState::Completed;
                true
            }
            JobState::Started | JobState::Running => {
                *state = JobState::Terminating;
                true
            }
            JobState::Terminating | JobState::Completed => false,
        });
    }

    /// Stop and abort the execution unit without waiting for the job to notice.
    ///
    /// Anything the job owned (child processes spawned with `kill_on_drop`,
    /// pump tasks) is dropped with it.
    pub fn interrupt(&self) {
        self.stop();
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        self.ctx.listeners().clear();
        self.state.send_replace(JobState::Completed);
    }

    /// Wait until the job reaches `Completed`.
    ///
    /// Never resolves for a container that is neither started nor stopped.
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == JobState::Completed).await;
    }

    /// Stop the job and wait for it to finish.
    pub async fn shutdown(&self) {
        self.stop();
        self.wait().await;
    }
}

impl Drop for JobContainer {
    fn drop(&mut self) {
        self.ctx.token().cancel();
    }
}

impl std::fmt::Debug for JobContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContainer")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("priority", &self.priority())
            .finish()
    }
}
