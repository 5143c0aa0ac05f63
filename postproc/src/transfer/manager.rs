//! Keeps at most one transfer running per destination path.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::info;

use super::{TransferJob, TransferTool};
use crate::config::{ProcessConfig, TransferConfig};
use crate::domain::Recording;
use crate::job::{CommandRunner, JobContainer, JobEvent, JobListener, ShellRunner};

struct ActiveTransfer {
    job: Arc<TransferJob>,
    container: Arc<JobContainer>,
}

type ActiveTransfers = Mutex<HashMap<PathBuf, ActiveTransfer>>;

pub struct TransferManager {
    tool: Arc<dyn TransferTool>,
    config: TransferConfig,
    process: ProcessConfig,
    runner: Arc<dyn CommandRunner>,
    active: Arc<ActiveTransfers>,
}

impl TransferManager {
    pub fn new(tool: Arc<dyn TransferTool>, config: TransferConfig, process: ProcessConfig) -> Self {
        Self {
            tool,
            config,
            process,
            runner: Arc::new(ShellRunner),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Start pulling `recording` into `destination`.
    ///
    /// A transfer already running for the same destination is superseded: its
    /// recording is cleared, which stops it. `listener` sees every event of the
    /// new transfer, ending with `Complete`.
    pub fn start(
        &self,
        recording: Arc<Recording>,
        destination: impl Into<PathBuf>,
        listener: Option<Arc<dyn JobListener>>,
    ) -> Arc<TransferJob> {
        let destination = destination.into();
        let job = Arc::new(
            TransferJob::new(recording.clone(), &destination, self.tool.clone(), self.config.clone())
                .with_runner(self.runner.clone())
                .with_process_config(self.process.clone()),
        );
        let container = Arc::new(JobContainer::new(job.clone()));

        let active: Weak<ActiveTransfers> = Arc::downgrade(&self.active);
        let this: Weak<JobContainer> = Arc::downgrade(&container);
        let key = destination.clone();
        container.add_listener(Arc::new(move |event: &JobEvent| {
            if event.is_complete() {
                if let Some(active) = active.upgrade() {
                    let mut active = active.lock();
                    let is_ours = active
                        .get(&key)
                        .is_some_and(|t| std::ptr::eq(Arc::as_ptr(&t.container), this.as_ptr()));
                    if is_ours {
                        active.remove(&key);
                    }
                }
            }
            if let Some(listener) = &listener {
                listener.on_job_event(event);
            }
        }));

        let previous = self.active.lock().insert(
            destination.clone(),
            ActiveTransfer {
                job: job.clone(),
                container: container.clone(),
            },
        );
        if let Some(previous) = previous {
            info!(
                destination = %destination.display(),
                "Superseding running transfer"
            );
            previous.job.set_recording(None);
            previous.container.stop();
        }

        info!(
            recording_id = %recording.id,
            destination = %destination.display(),
            tool = self.tool.name(),
            "Starting transfer"
        );
        container.start();
        job
    }

    /// Stop the transfer into `destination`. Returns whether one was running.
    pub fn cancel(&self, destination: &Path) -> bool {
        let Some(transfer) = self.active.lock().remove(destination) else {
            return false;
        };
        info!(destination = %destination.display(), "Cancelling transfer");
        transfer.job.set_recording(None);
        transfer.container.stop();
        true
    }

    pub fn is_active(&self, destination: &Path) -> bool {
        self.active.lock().contains_key(destination)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Stop every transfer and wait for them to finish.
    pub async fn shutdown(&self) {
        let transfers: Vec<ActiveTransfer> =
            self.active.lock().drain().map(|(_, t)| t).collect();
        for transfer in &transfers {
            transfer.job.set_recording(None);
            transfer.container.stop();
        }
        for transfer in transfers {
            transfer.container.wait().await;
        }
    }
}
