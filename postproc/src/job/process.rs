//! External process jobs.
//!
//! A [`ProcessJob`] runs one shell command line, captures stdout and stderr
//! into a shared [`OutputBuffer`], and records how the process ended. The
//! captured text is advisory: it is meant for substring checks such as
//! "file is already fully retrieved", not for byte-exact parsing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{DEFAULT_POLL_INTERVAL, Job, JobContext, JobEventKind};
use crate::Error;
use crate::config::ProcessConfig;

/// Default cap on captured output.
pub const DEFAULT_OUTPUT_LIMIT: usize = 64 * 1024;

/// How long pump tasks may keep draining after the process exited.
///
/// Grandchildren that inherited the pipes can keep them open indefinitely.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// What to run and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub command_line: String,
    pub working_dir: Option<PathBuf>,
    /// Directory prepended to the inherited `PATH`.
    pub extra_path: Option<PathBuf>,
    /// Bytes written to the child's stdin, which is then closed.
    pub stdin: Option<Vec<u8>>,
    pub output_limit: usize,
}

impl ProcessSpec {
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
            working_dir: None,
            extra_path: None,
            stdin: None,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_extra_path(mut self, dir: Option<PathBuf>) -> Self {
        self.extra_path = dir;
        self
    }

    pub fn with_stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    /// Apply engine-wide process settings.
    pub fn with_config(self, config: &ProcessConfig) -> Self {
        self.with_extra_path(config.extra_path.clone())
            .with_output_limit(config.output_limit_bytes)
    }
}

/// How a process run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The process exited on its own with this code.
    Exited(i32),
    /// The process was killed, by us or by a signal.
    Terminated,
    /// The process could not be started at all.
    SpawnFailed(String),
}

impl ProcessOutcome {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessOutcome::Exited(code) => Some(*code),
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ProcessOutcome::Exited(0))
    }

    pub fn is_spawn_failure(&self) -> bool {
        matches!(self, ProcessOutcome::SpawnFailed(_))
    }
}

impl fmt::Display for ProcessOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessOutcome::Exited(code) => write!(f, "exited with code {}", code),
            ProcessOutcome::Terminated => write!(f, "terminated"),
            ProcessOutcome::SpawnFailed(reason) => write!(f, "spawn failed: {}", reason),
        }
    }
}

/// Append-only text buffer holding at most `limit` bytes.
///
/// Each chunk is trimmed and followed by a newline; once over the limit the
/// oldest text is discarded.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    text: String,
    limit: usize,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
        }
    }

    pub fn append(&mut self, chunk: &str) {
        let chunk = chunk.trim();
        if chunk.is_empty() {
            return;
        }
        self.text.push_str(chunk);
        self.text.push('\n');

        if self.limit > 0 && self.text.len() > self.limit {
            let mut cut = self.text.len() - self.limit;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.text.contains(needle)
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }
}

/// Runs one shell command line as a job.
///
/// The job fires a payload-less `Complete` event when the process is gone;
/// read [`outcome`](Self::outcome), [`exit_value`](Self::exit_value) and
/// [`output_text`](Self::output_text) afterwards.
pub struct ProcessJob {
    name: String,
    spec: ProcessSpec,
    poll_interval: Duration,
    output: Arc<Mutex<OutputBuffer>>,
    outcome: Mutex<Option<ProcessOutcome>>,
}

impl ProcessJob {
    pub fn new(name: impl Into<String>, spec: ProcessSpec) -> Self {
        let output = OutputBuffer::new(spec.output_limit);
        Self {
            name: name.into(),
            spec,
            poll_interval: DEFAULT_POLL_INTERVAL,
            output: Arc::new(Mutex::new(output)),
            outcome: Mutex::new(None),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    /// How the last run ended; `None` while running or before the first run.
    pub fn outcome(&self) -> Option<ProcessOutcome> {
        self.outcome.lock().clone()
    }

    /// Exit code of the last run, if the process exited on its own.
    pub fn exit_value(&self) -> Option<i32> {
        self.outcome().and_then(|o| o.exit_code())
    }

    pub fn output_text(&self) -> String {
        self.output.lock().as_str().to_string()
    }

    /// Spawn the process and wait for it, killing it if `token` fires first.
    pub async fn execute(&self, token: &CancellationToken) -> ProcessOutcome {
        self.output.lock().clear();
        *self.outcome.lock() = None;

        let outcome = self.spawn_and_wait(token).await;
        *self.outcome.lock() = Some(outcome.clone());
        outcome
    }

    async fn spawn_and_wait(&self, token: &CancellationToken) -> ProcessOutcome {
        let mut cmd = process_utils::tokio_shell_command(&self.spec.command_line);
        if let Some(dir) = &self.spec.working_dir {
            cmd.current_dir(dir);
        }
        if let Some(extra) = &self.spec.extra_path {
            match process_utils::augmented_path(extra) {
                Some(path) => {
                    cmd.env("PATH", path);
                }
                None => warn!(job = %self.name, dir = %extra.display(), "Cannot add directory to PATH"),
            }
        }
        cmd.stdin(if self.spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        debug!(job = %self.name, command = %self.spec.command_line, "Spawning process");

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = Error::spawn(&self.spec.command_line, e);
                warn!(job = %self.name, error = %err, "Process spawn failed");
                return ProcessOutcome::SpawnFailed(err.to_string());
            }
        };

        // Pump sub-tasks: stdin writer plus one reader per output stream.
        let mut pumps = JoinSet::new();
        if let (Some(stdin), Some(payload)) = (child.stdin.take(), self.spec.stdin.clone()) {
            pumps.spawn(write_stdin(stdin, payload));
        }
        if let Some(stdout) = child.stdout.take() {
            pumps.spawn(pump_output(stdout, self.output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.spawn(pump_output(stderr, self.output.clone()));
        }

        let outcome = tokio::select! {
            _ = token.cancelled() => {
                info!(job = %self.name, "Killing process");
                if let Err(e) = child.kill().await {
                    warn!(job = %self.name, error = %e, "Failed to kill process");
                }
                ProcessOutcome::Terminated
            }
            status = child.wait() => match status {
                Ok(status) => match status.code() {
                    Some(code) => ProcessOutcome::Exited(code),
                    None => ProcessOutcome::Terminated,
                },
                Err(e) => {
                    warn!(job = %self.name, error = %e, "Failed to wait for process");
                    ProcessOutcome::Terminated
                }
            },
        };

        if outcome == ProcessOutcome::Terminated {
            pumps.abort_all();
        } else {
            let drained = tokio::time::timeout(PUMP_DRAIN_TIMEOUT, async {
                while pumps.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                debug!(job = %self.name, "Output pipes still open after exit; detaching");
                pumps.abort_all();
            }
        }

        debug!(job = %self.name, outcome = %outcome, "Process finished");
        outcome
    }
}

#[async_trait]
impl Job for ProcessJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn run(&self, ctx: &JobContext) -> crate::Result<()> {
        self.execute(ctx.token()).await;
        ctx.fire(JobEventKind::Complete, None);
        Ok(())
    }
}

impl fmt::Debug for ProcessJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessJob")
            .field("name", &self.name)
            .field("command_line", &self.spec.command_line)
            .field("outcome", &self.outcome())
            .finish()
    }
}

async fn pump_output<R>(mut reader: R, output: Arc<Mutex<OutputBuffer>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]);
                trace!(output = %chunk.trim(), "process output");
                output.lock().append(&chunk);
            }
            Err(e) => {
                debug!(error = %e, "Output pipe read failed");
                break;
            }
        }
    }
}

async fn write_stdin(mut stdin: ChildStdin, payload: Vec<u8>) {
    if let Err(e) = stdin.write_all(&payload).await {
        debug!(error = %e, "Failed to write process stdin");
        return;
    }
    let _ = stdin.shutdown().await;
}

/// Result of running a command to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub outcome: ProcessOutcome,
    pub output: String,
}

impl CommandResult {
    pub fn exited(code: i32, output: impl Into<String>) -> Self {
        Self {
            outcome: ProcessOutcome::Exited(code),
            output: output.into(),
        }
    }
}

/// Runs command lines on behalf of higher-level jobs.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: ProcessSpec, token: &CancellationToken) -> CommandResult;
}

/// [`CommandRunner`] backed by [`ProcessJob`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, spec: ProcessSpec, token: &CancellationToken) -> CommandResult {
        let job = ProcessJob::new("shell", spec);
        let outcome = job.execute(token).await;
        CommandResult {
            outcome,
            output: job.output_text(),
        }
    }
}
