//! Asynchronous job abstraction.
//!
//! A [`Job`] is a unit of work with a `run` body. A [`JobContainer`] owns one
//! job, runs it on its own tokio task and stops it cooperatively through the
//! termination flag carried by the [`JobContext`].
//!
//! ```text
//! Created --start--> Started --> Running --stop--> Terminating --> Completed
//!                                   \______________(run returns)__/
//! ```

mod container;
mod event;
pub mod process;

pub use container::{JobContainer, JobPriority};
pub use event::{JobEvent, JobEventKind, JobListener, ListenerId, ListenerSet};
pub use process::{
    CommandResult, CommandRunner, OutputBuffer, ProcessJob, ProcessOutcome, ProcessSpec,
    ShellRunner,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Default interval at which jobs re-check their termination flag.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobState {
    Created,
    Started,
    Running,
    Terminating,
    Completed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Created => write!(f, "created"),
            JobState::Started => write!(f, "started"),
            JobState::Running => write!(f, "running"),
            JobState::Terminating => write!(f, "terminating"),
            JobState::Completed => write!(f, "completed"),
        }
    }
}

/// Per-run context handed to [`Job::run`].
#[derive(Clone)]
pub struct JobContext {
    name: Arc<str>,
    token: CancellationToken,
    poll_interval: Duration,
    listeners: Arc<ListenerSet>,
}

impl JobContext {
    pub fn new(
        name: impl Into<Arc<str>>,
        token: CancellationToken,
        poll_interval: Duration,
        listeners: Arc<ListenerSet>,
    ) -> Self {
        Self {
            name: name.into(),
            token,
            poll_interval,
            listeners,
        }
    }

    /// A detached context, for running a job body outside a container.
    pub fn detached(name: impl Into<Arc<str>>) -> Self {
        Self::new(
            name,
            CancellationToken::new(),
            DEFAULT_POLL_INTERVAL,
            Arc::new(ListenerSet::new()),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The termination flag.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_terminate(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn listeners(&self) -> &Arc<ListenerSet> {
        &self.listeners
    }

    /// Fire an event of `kind` attributed to this job.
    pub fn fire(&self, kind: JobEventKind, message: Option<String>) {
        let mut event = JobEvent::new(kind, self.name.as_ref());
        event.message = message;
        self.listeners.fire(&event);
    }

    pub fn fire_event(&self, event: &JobEvent) {
        self.listeners.fire(event);
    }

    /// Sleep for `duration` unless terminated first.
    ///
    /// Returns `true` when the full duration elapsed and the job should carry on.
    pub async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(duration) => !self.token.is_cancelled(),
        }
    }

    /// Wait until the termination flag is raised, re-checking every poll interval.
    pub async fn wait_terminated(&self) {
        while self.pause(self.poll_interval).await {}
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("name", &self.name)
            .field("terminated", &self.is_terminate())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

/// A unit of asynchronous work.
///
/// Implementations must check [`JobContext::is_terminate`] (or await the
/// token) on every loop iteration; cancellation is cooperative.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Name used in events and logs.
    fn name(&self) -> &str;

    /// Interval at which the job re-checks its termination flag.
    fn poll_interval(&self) -> Duration {
        DEFAULT_POLL_INTERVAL
    }

    /// The job body. Errors are logged by the container and treated as a stop.
    async fn run(&self, ctx: &JobContext) -> Result<()>;
}
