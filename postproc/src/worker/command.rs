//! Worker running a shell command template.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{info, warn};

use super::Worker;
use crate::config::ProcessConfig;
use crate::domain::Recording;
use crate::job::{
    JobContainer, JobEvent, JobEventKind, JobListener, ProcessJob, ProcessOutcome, ProcessSpec,
};

/// Configuration of a [`CommandWorker`].
///
/// `command` may use the placeholders `{input}` (media path), `{dir}` (parent
/// directory), `{stem}` (file name without extension), `{id}` and `{title}`.
/// Each expands to a single shell-quoted word; do not quote them again in the
/// template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandWorkerConfig {
    pub title: String,
    #[serde(default)]
    pub heavy: bool,
    pub command: String,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

type ActiveJobs = Mutex<HashMap<String, Arc<JobContainer>>>;

/// Runs one [`ProcessJob`] per recording.
pub struct CommandWorker {
    config: CommandWorkerConfig,
    process: ProcessConfig,
    active: Arc<ActiveJobs>,
}

impl CommandWorker {
    pub fn new(config: CommandWorkerConfig, process: ProcessConfig) -> Self {
        Self {
            config,
            process,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of recordings currently being processed.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Expand the command template for `recording`.
    ///
    /// Every placeholder is substituted in one pass and quoted for the shell,
    /// so values are never re-expanded or split.
    pub fn command_line(&self, recording: &Recording) -> String {
        let path = &recording.path;
        let dir = path.parent().map(|p| p.to_path_buf()).unwrap_or_default();
        let stem = path.file_stem().unwrap_or_default();

        let mut line = String::with_capacity(self.config.command.len());
        let mut rest = self.config.command.as_str();
        while let Some(open) = rest.find('{') {
            line.push_str(&rest[..open]);
            let tail = &rest[open..];
            let Some(close) = tail.find('}') else {
                rest = tail;
                break;
            };
            let value = match &tail[1..close] {
                "input" => Some(process_utils::quote_arg(path)),
                "dir" => Some(process_utils::quote_arg(&dir)),
                "stem" => Some(process_utils::quote_arg(stem)),
                "id" => Some(process_utils::quote_arg(&recording.id)),
                "title" => Some(process_utils::quote_arg(&recording.title)),
                _ => None,
            };
            match value {
                Some(value) => {
                    line.push_str(&value);
                    rest = &tail[close + 1..];
                }
                None => {
                    line.push('{');
                    rest = &tail[1..];
                }
            }
        }
        line.push_str(rest);
        line
    }

    fn spec(&self, recording: &Recording) -> ProcessSpec {
        let spec = ProcessSpec::new(self.command_line(recording)).with_config(&self.process);
        match &self.config.working_dir {
            Some(dir) => spec.with_working_dir(dir),
            None => spec,
        }
    }
}

impl Worker for CommandWorker {
    fn title(&self) -> &str {
        &self.config.title
    }

    fn is_heavy(&self) -> bool {
        self.config.heavy
    }

    fn work(&self, recording: Arc<Recording>, listener: Arc<dyn JobListener>) {
        let name = format!("{}:{}", self.config.title, recording.id);
        let job = Arc::new(
            ProcessJob::new(name, self.spec(&recording))
                .with_poll_interval(Duration::from_millis(self.process.poll_interval_ms)),
        );
        let container = Arc::new(JobContainer::new(job.clone()));

        let title = self.config.title.clone();
        let recording_id = recording.id.clone();
        let active: Weak<ActiveJobs> = Arc::downgrade(&self.active);
        let this: Weak<JobContainer> = Arc::downgrade(&container);
        container.add_listener(Arc::new(move |event: &JobEvent| {
            if !event.is_complete() {
                return;
            }
            // Only forget our own entry; a newer run may have replaced it.
            if let Some(active) = active.upgrade() {
                let mut active = active.lock();
                let is_ours = active
                    .get(&recording_id)
                    .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), this.as_ptr()));
                if is_ours {
                    active.remove(&recording_id);
                }
            }

            let outcome = job.outcome().unwrap_or(ProcessOutcome::Terminated);
            if outcome.success() {
                info!(worker = %title, recording_id = %recording_id, "Command finished");
            } else {
                warn!(
                    worker = %title,
                    recording_id = %recording_id,
                    outcome = %outcome,
                    output = %job.output_text(),
                    "Command did not succeed"
                );
                listener.on_job_event(
                    &JobEvent::new(JobEventKind::Failed, title.as_str())
                        .with_message(outcome.to_string()),
                );
            }
            listener.on_job_event(
                &JobEvent::complete(title.as_str()).with_message(outcome.to_string()),
            );
        }));

        if let Some(previous) = self
            .active
            .lock()
            .insert(recording.id.clone(), container.clone())
        {
            warn!(worker = %self.config.title, recording_id = %recording.id, "Replacing running command");
            previous.stop();
        }

        info!(worker = %self.config.title, recording_id = %recording.id, "Starting command");
        container.start();
    }

    fn cancel(&self, recording: &Recording) {
        let container = self.active.lock().get(&recording.id).cloned();
        if let Some(container) = container {
            info!(worker = %self.config.title, recording_id = %recording.id, "Cancelling command");
            container.stop();
        }
    }
}
