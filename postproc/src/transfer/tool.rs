//! Transfer tools: how to build a download command and how to judge its result.

use std::path::Path;

use crate::config::TransferConfig;
use crate::job::{CommandResult, ProcessOutcome};

/// curl exit code for "HTTP range error / server doesn't support byte ranges".
pub const CURL_RANGE_ERROR: i32 = 33;

/// Default resume budget for curl byte-range failures.
pub const MAX_RANGE_FAILURE_COUNT: u32 = 10;

/// Default resume budget for wget.
pub const MAX_FAILURE_COUNT: u32 = 20;

/// Text wget prints when a resumed download has nothing left to fetch.
pub const WGET_COMPLETE_MARKER: &str = "file is already fully retrieved";

/// What to do after one run of a transfer command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferVerdict {
    /// Stop for good; the file is complete or resuming cannot help.
    Done,
    /// The file is incomplete; run again with resume enabled.
    Resume,
}

/// A command-line download tool.
pub trait TransferTool: Send + Sync {
    fn name(&self) -> &'static str;

    /// Command line downloading `url` into `destination`.
    fn command_line(&self, url: &str, destination: &Path, rate_limit: &str, resume: bool) -> String;

    fn assess(&self, result: &CommandResult) -> TransferVerdict;

    /// How many resumed attempts are allowed.
    fn failure_budget(&self, config: &TransferConfig) -> u32;
}

/// `curl`, judged by exit code.
#[derive(Debug, Clone, Copy, Default)]
pub struct Curl;

impl TransferTool for Curl {
    fn name(&self) -> &'static str {
        "curl"
    }

    fn command_line(&self, url: &str, destination: &Path, rate_limit: &str, resume: bool) -> String {
        let mut cmd = format!(
            "curl --silent --show-error --limit-rate {}",
            process_utils::quote_arg(rate_limit)
        );
        if resume {
            cmd.push_str(" -C -");
        }
        cmd.push_str(&format!(
            " -o {} {}",
            process_utils::quote_arg(destination),
            process_utils::quote_arg(url)
        ));
        cmd
    }

    fn assess(&self, result: &CommandResult) -> TransferVerdict {
        match result.outcome {
            ProcessOutcome::Exited(CURL_RANGE_ERROR) => TransferVerdict::Resume,
            _ => TransferVerdict::Done,
        }
    }

    fn failure_budget(&self, config: &TransferConfig) -> u32 {
        config.max_range_failures
    }
}

/// `wget`, judged by its output text.
#[derive(Debug, Clone, Copy, Default)]
pub struct Wget;

impl TransferTool for Wget {
    fn name(&self) -> &'static str {
        "wget"
    }

    fn command_line(&self, url: &str, destination: &Path, rate_limit: &str, resume: bool) -> String {
        let mut cmd = format!("wget --limit-rate={}", process_utils::quote_arg(rate_limit));
        if resume {
            cmd.push_str(" -c");
        }
        cmd.push_str(&format!(
            " -O {} {}",
            process_utils::quote_arg(destination),
            process_utils::quote_arg(url)
        ));
        cmd
    }

    fn assess(&self, result: &CommandResult) -> TransferVerdict {
        match result.outcome {
            ProcessOutcome::SpawnFailed(_) | ProcessOutcome::Terminated => TransferVerdict::Done,
            ProcessOutcome::Exited(_) if result.output.contains(WGET_COMPLETE_MARKER) => {
                TransferVerdict::Done
            }
            ProcessOutcome::Exited(_) => TransferVerdict::Resume,
        }
    }

    fn failure_budget(&self, config: &TransferConfig) -> u32 {
        config.max_consecutive_failures
    }
}
