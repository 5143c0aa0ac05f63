//! Engine configuration.
//!
//! Settings are read from a JSON file and then overlaid with `POSTPROC_*`
//! environment variables. Every field has a default, so an empty object is a
//! valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::logging::DEFAULT_LOG_FILTER;
use crate::worker::CommandWorkerConfig;
use crate::{Error, Result};

/// Settings for one scheduling lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Maximum number of items in flight at once.
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
    /// Delay between poller ticks in milliseconds.
    #[serde(default = "default_lane_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Number of times an item whose media is missing is popped before it is dropped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_jobs() -> usize {
    1
}

fn default_lane_poll_interval_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    20
}

impl LaneConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            max_jobs: default_max_jobs(),
            poll_interval_ms: default_lane_poll_interval_ms(),
            max_retries: default_max_retries(),
        }
    }
}

/// Settings for resumable transfers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Bandwidth cap handed to the transfer tool (e.g. `2m`, `500k`).
    #[serde(default = "default_rate_limit")]
    pub rate_limit: String,
    /// Pause before a resumed attempt, in milliseconds.
    #[serde(default = "default_rest_interval_ms")]
    pub rest_interval_ms: u64,
    /// Resume budget for tools judged by their output text (wget).
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Resume budget for byte-range failures (curl exit code 33).
    #[serde(default = "default_max_range_failures")]
    pub max_range_failures: u32,
}

fn default_rate_limit() -> String {
    "2m".to_string()
}

fn default_rest_interval_ms() -> u64 {
    5_000
}

fn default_max_consecutive_failures() -> u32 {
    20
}

fn default_max_range_failures() -> u32 {
    10
}

impl TransferConfig {
    pub fn rest_interval(&self) -> Duration {
        Duration::from_millis(self.rest_interval_ms)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            rate_limit: default_rate_limit(),
            rest_interval_ms: default_rest_interval_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            max_range_failures: default_max_range_failures(),
        }
    }
}

/// Settings applied to every spawned external process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Directory prepended to `PATH` for spawned commands.
    #[serde(default)]
    pub extra_path: Option<PathBuf>,
    /// Upper bound on captured output text; older text is discarded first.
    #[serde(default = "default_output_limit_bytes")]
    pub output_limit_bytes: usize,
    /// Termination-flag poll interval for process jobs, in milliseconds.
    #[serde(default = "default_process_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_output_limit_bytes() -> usize {
    64 * 1024
}

fn default_process_poll_interval_ms() -> u64 {
    500
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            extra_path: None,
            output_limit_bytes: default_output_limit_bytes(),
            poll_interval_ms: default_process_poll_interval_ms(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostProcConfig {
    #[serde(default)]
    pub heavy_lane: LaneConfig,
    /// `max_jobs` is ignored for this lane; it always runs one item at a time.
    #[serde(default)]
    pub light_lane: LaneConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    /// Command workers registered at startup.
    #[serde(default)]
    pub workers: Vec<CommandWorkerConfig>,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Directory for rolling log files; console only when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

impl Default for PostProcConfig {
    fn default() -> Self {
        Self {
            heavy_lane: LaneConfig::default(),
            light_lane: LaneConfig::default(),
            transfer: TransferConfig::default(),
            process: ProcessConfig::default(),
            workers: Vec::new(),
            log_filter: default_log_filter(),
            log_dir: None,
        }
    }
}

impl PostProcConfig {
    /// Read a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Parse a configuration from JSON text.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay settings from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(std::env::vars())
    }

    /// Overlay settings from `POSTPROC_*` key/value pairs.
    pub fn apply_vars<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in vars {
            let value = value.into();
            match key.as_ref() {
                "POSTPROC_MAX_HEAVY_JOBS" => self.heavy_lane.max_jobs = parse_var(&key, &value)?,
                "POSTPROC_POLL_INTERVAL_MS" => {
                    let interval = parse_var(&key, &value)?;
                    self.heavy_lane.poll_interval_ms = interval;
                    self.light_lane.poll_interval_ms = interval;
                }
                "POSTPROC_MAX_RETRIES" => {
                    let retries = parse_var(&key, &value)?;
                    self.heavy_lane.max_retries = retries;
                    self.light_lane.max_retries = retries;
                }
                "POSTPROC_TRANSFER_RATE_LIMIT" => self.transfer.rate_limit = value,
                "POSTPROC_TRANSFER_REST_MS" => {
                    self.transfer.rest_interval_ms = parse_var(&key, &value)?
                }
                "POSTPROC_TRANSFER_MAX_FAILURES" => {
                    self.transfer.max_consecutive_failures = parse_var(&key, &value)?
                }
                "POSTPROC_TRANSFER_MAX_RANGE_FAILURES" => {
                    self.transfer.max_range_failures = parse_var(&key, &value)?
                }
                "POSTPROC_EXTRA_PATH" => self.process.extra_path = Some(PathBuf::from(value)),
                "POSTPROC_LOG_FILTER" => self.log_filter = value,
                "POSTPROC_LOG_DIR" => self.log_dir = Some(PathBuf::from(value)),
                _ => {}
            }
        }
        self.validate()
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.heavy_lane.max_jobs == 0 {
            return Err(Error::config("heavy_lane.max_jobs must be at least 1"));
        }
        if self.heavy_lane.poll_interval_ms == 0 || self.light_lane.poll_interval_ms == 0 {
            return Err(Error::config("lane poll_interval_ms must be positive"));
        }
        if self.transfer.rate_limit.trim().is_empty() {
            return Err(Error::config("transfer.rate_limit must not be empty"));
        }
        if let Some(worker) = self.workers.iter().find(|w| w.title.trim().is_empty()) {
            return Err(Error::config(format!(
                "worker with command `{}` has no title",
                worker.command
            )));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: impl AsRef<str>, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        Error::config(format!("Invalid value for {}: {}", key.as_ref(), value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PostProcConfig::default();
        assert_eq!(config.heavy_lane.max_jobs, 1);
        assert_eq!(config.heavy_lane.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.light_lane.max_retries, 20);
        assert_eq!(config.transfer.max_consecutive_failures, 20);
        assert_eq!(config.transfer.max_range_failures, 10);
        assert_eq!(config.process.poll_interval_ms, 500);
    }

    #[test]
    fn test_parse_partial_json() {
        let json = r#"{
            "heavy_lane": {"max_jobs": 3},
            "transfer": {"rate_limit": "500k"},
            "workers": [{"title": "comskip", "heavy": true, "command": "comskip {input}"}]
        }"#;

        let config = PostProcConfig::from_json(json).unwrap();
        assert_eq!(config.heavy_lane.max_jobs, 3);
        assert_eq!(config.heavy_lane.max_retries, 20); // default
        assert_eq!(config.transfer.rate_limit, "500k");
        assert_eq!(config.transfer.rest_interval_ms, 5_000); // default
        assert_eq!(config.workers.len(), 1);
        assert!(config.workers[0].heavy);
    }

    #[test]
    fn test_empty_object_is_valid() {
        let config = PostProcConfig::from_json("{}").unwrap();
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn test_zero_heavy_jobs_rejected() {
        let err = PostProcConfig::from_json(r#"{"heavy_lane": {"max_jobs": 0}}"#).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_env_overlay() {
        let mut config = PostProcConfig::default();
        config
            .apply_vars([
                ("POSTPROC_MAX_HEAVY_JOBS", "2"),
                ("POSTPROC_POLL_INTERVAL_MS", "250"),
                ("POSTPROC_TRANSFER_RATE_LIMIT", "1m"),
                ("POSTPROC_TRANSFER_MAX_FAILURES", "30"),
                ("POSTPROC_TRANSFER_MAX_RANGE_FAILURES", "4"),
                ("UNRELATED", "ignored"),
            ])
            .unwrap();

        assert_eq!(config.heavy_lane.max_jobs, 2);
        assert_eq!(config.light_lane.poll_interval_ms, 250);
        assert_eq!(config.transfer.rate_limit, "1m");
        assert_eq!(config.transfer.max_consecutive_failures, 30);
        assert_eq!(config.transfer.max_range_failures, 4);
    }

    #[test]
    fn test_env_overlay_rejects_garbage() {
        let mut config = PostProcConfig::default();
        let err = config
            .apply_vars([("POSTPROC_MAX_RETRIES", "many")])
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = PostProcConfig::load("/nonexistent/postproc.json").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
