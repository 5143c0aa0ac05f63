//! Recordings and the rules that say how to post-process them.
//!
//! These entities are owned by the recording store (see [`crate::nms`]); the
//! engine only reads them and asks the store to persist changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Extension suffix used by segmented (HLS) captures for their first segment.
pub const SEGMENT_SUFFIX: &str = "000000.ts";

/// A captured media file plus metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recording {
    pub id: String,
    pub title: String,
    /// Local media file.
    pub path: PathBuf,
    /// Remote stream the recording can be pulled from.
    #[serde(default)]
    pub stream_url: Option<String>,
    /// Rule that produced this recording.
    #[serde(default)]
    pub rule_id: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Free-form fields workers may fill in (commercial markers, chapters...).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Recording {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            id: id.into(),
            title,
            path,
            stream_url: None,
            rule_id: None,
            started_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_stream_url(mut self, url: impl Into<String>) -> Self {
        self.stream_url = Some(url.into());
        self
    }

    pub fn with_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    /// Copy onto `self` the fields `after` changed relative to `before`.
    ///
    /// Fields the worker left alone keep the value `self` holds, so writes
    /// made by others since `before` was taken survive.
    pub fn apply_changes(&mut self, before: &Recording, after: &Recording) {
        if after.title != before.title {
            self.title = after.title.clone();
        }
        if after.stream_url != before.stream_url {
            self.stream_url = after.stream_url.clone();
        }
        for (key, value) in &after.metadata {
            if before.metadata.get(key) != Some(value) {
                self.metadata.insert(key.clone(), value.clone());
            }
        }
        for key in before.metadata.keys() {
            if !after.metadata.contains_key(key) {
                self.metadata.remove(key);
            }
        }
    }

    /// Alternate path used by segmented captures: `<base>.000000.ts`.
    pub fn segmented_path(&self) -> PathBuf {
        segmented_path(&self.path)
    }

    /// Whether the media file, or its first segment, exists on disk.
    pub async fn media_present(&self) -> bool {
        for candidate in [self.path.clone(), self.segmented_path()] {
            if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                return true;
            }
        }
        false
    }
}

/// Replace the extension of `path` with [`SEGMENT_SUFFIX`].
pub fn segmented_path(path: &Path) -> PathBuf {
    path.with_extension(SEGMENT_SUFFIX)
}

/// One configured post-processing task of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSetting {
    /// Title of the worker that performs the task.
    pub title: String,
    /// Whether the task is enabled.
    #[serde(default = "default_true")]
    pub run: bool,
}

fn default_true() -> bool {
    true
}

impl TaskSetting {
    pub fn enabled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            run: true,
        }
    }

    pub fn disabled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            run: false,
        }
    }
}

/// A recording rule and its post-processing tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<TaskSetting>,
    /// Persist the recording after each of its tasks completes.
    #[serde(default)]
    pub update_recording: bool,
}

impl RecordingRule {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tasks: Vec::new(),
            update_recording: false,
        }
    }

    pub fn with_task(mut self, task: TaskSetting) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_update_recording(mut self, update: bool) -> Self {
        self.update_recording = update;
        self
    }

    /// Titles of enabled tasks, in configuration order.
    pub fn enabled_tasks(&self) -> impl Iterator<Item = &str> {
        self.tasks
            .iter()
            .filter(|task| task.run)
            .map(|task| task.title.as_str())
    }
}
