//! Resumable, rate-limited stream transfers.
//!
//! A [`TransferJob`] pulls a recording's remote stream into a local file with
//! an external tool (see [`tool`]). Recordings may still be growing while they
//! are pulled, so an incomplete transfer is not fatal: the job rests, then
//! reissues the command with resume enabled, until the tool reports the file
//! complete or the failure budget runs out.

mod manager;
pub mod tool;

pub use manager::TransferManager;
pub use tool::{Curl, TransferTool, TransferVerdict, Wget};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ProcessConfig, TransferConfig};
use crate::domain::Recording;
use crate::job::{
    CommandResult, CommandRunner, Job, JobContext, JobEventKind, ProcessSpec, ShellRunner,
};

/// Downloads one recording to one destination path.
pub struct TransferJob {
    name: String,
    recording: Mutex<Option<Arc<Recording>>>,
    destination: PathBuf,
    tool: Arc<dyn TransferTool>,
    runner: Arc<dyn CommandRunner>,
    config: TransferConfig,
    process: ProcessConfig,
    /// Commands reissued with resume forced on; bounded by the tool's budget.
    reissues: AtomicU32,
    /// Termination flag of the current run, if any.
    active_token: Mutex<Option<CancellationToken>>,
    last_result: Mutex<Option<CommandResult>>,
}

impl TransferJob {
    pub fn new(
        recording: Arc<Recording>,
        destination: impl Into<PathBuf>,
        tool: Arc<dyn TransferTool>,
        config: TransferConfig,
    ) -> Self {
        let destination = destination.into();
        Self {
            name: format!("transfer:{}:{}", tool.name(), recording.id),
            recording: Mutex::new(Some(recording)),
            destination,
            tool,
            runner: Arc::new(ShellRunner),
            config,
            process: ProcessConfig::default(),
            reissues: AtomicU32::new(0),
            active_token: Mutex::new(None),
            last_result: Mutex::new(None),
        }
    }

    /// Replace the process runner.
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_process_config(mut self, process: ProcessConfig) -> Self {
        self.process = process;
        self
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn recording(&self) -> Option<Arc<Recording>> {
        self.recording.lock().clone()
    }

    /// Swap the recording being transferred.
    ///
    /// Clearing it stops a running transfer immediately; the child process is
    /// killed and the job completes.
    pub fn set_recording(&self, recording: Option<Arc<Recording>>) {
        let cleared = recording.is_none();
        *self.recording.lock() = recording;
        if cleared {
            if let Some(token) = self.active_token.lock().as_ref() {
                debug!(job = %self.name, "Recording cleared; stopping transfer");
                token.cancel();
            }
        }
    }

    /// Number of times the command was reissued with resume forced on.
    pub fn reissue_count(&self) -> u32 {
        self.reissues.load(Ordering::SeqCst)
    }

    /// Result of the most recent command run.
    pub fn last_result(&self) -> Option<CommandResult> {
        self.last_result.lock().clone()
    }

    async fn destination_exists(&self) -> bool {
        tokio::fs::try_exists(&self.destination)
            .await
            .unwrap_or(false)
    }

    /// Run one command; returns `None` when there is nothing to transfer.
    async fn attempt(&self, ctx: &JobContext, resume: bool) -> Option<TransferVerdict> {
        let recording = self.recording()?;
        let Some(url) = recording.stream_url.as_deref() else {
            warn!(job = %self.name, recording_id = %recording.id, "Recording has no stream URL");
            return None;
        };

        let command_line =
            self.tool
                .command_line(url, &self.destination, &self.config.rate_limit, resume);
        debug!(job = %self.name, command = %command_line, resume, "Issuing transfer command");

        let spec = ProcessSpec::new(command_line).with_config(&self.process);
        let result = self.runner.run(spec, ctx.token()).await;
        let verdict = self.tool.assess(&result);
        debug!(job = %self.name, outcome = %result.outcome, ?verdict, "Transfer command finished");
        *self.last_result.lock() = Some(result);
        Some(verdict)
    }
}

#[async_trait]
impl Job for TransferJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &JobContext) -> crate::Result<()> {
        *self.active_token.lock() = Some(ctx.token().clone());
        if self.recording().is_none() {
            ctx.token().cancel();
        }

        let budget = self.tool.failure_budget(&self.config);
        let mut reissue = false;

        while !ctx.is_terminate() {
            let resume = reissue || self.destination_exists().await;
            let Some(verdict) = self.attempt(ctx, resume).await else {
                break;
            };
            if ctx.is_terminate() {
                break;
            }

            match verdict {
                TransferVerdict::Done => {
                    info!(job = %self.name, reissues = self.reissue_count(), "Transfer finished");
                    break;
                }
                TransferVerdict::Resume => {
                    let failures = self.reissue_count();
                    if failures >= budget {
                        warn!(
                            job = %self.name,
                            failures,
                            "Transfer still incomplete after retry budget; giving up"
                        );
                        ctx.fire(
                            JobEventKind::Failed,
                            Some(format!("transfer incomplete after {} resumes", failures)),
                        );
                        break;
                    }

                    self.reissues.fetch_add(1, Ordering::SeqCst);
                    reissue = true;
                    debug!(
                        job = %self.name,
                        attempt = failures + 1,
                        rest = ?self.config.rest_interval(),
                        "Transfer incomplete; resuming after rest"
                    );
                    if !ctx.pause(self.config.rest_interval()).await {
                        break;
                    }
                }
            }
        }

        let message = self.last_result().map(|r| r.outcome.to_string());
        ctx.fire(JobEventKind::Complete, message);
        Ok(())
    }
}

impl fmt::Debug for TransferJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferJob")
            .field("name", &self.name)
            .field("destination", &self.destination)
            .field("tool", &self.tool.name())
            .field("reissues", &self.reissue_count())
            .finish()
    }
}
