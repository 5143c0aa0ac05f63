//! Recording store collaborator.
//!
//! The store owns recordings and rules. The engine asks it which recordings
//! are waiting for post-processing and hands back recordings whose fields
//! changed.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use crate::domain::{Recording, RecordingRule};
use crate::{Error, Result};

/// Source of recordings and rules, and sink for recording updates.
#[async_trait]
pub trait RecordingStore: Send + Sync {
    async fn recordings(&self) -> Result<Vec<Recording>>;

    async fn recording_rules(&self) -> Result<Vec<RecordingRule>>;

    /// Current copy of one recording, if the store still has it.
    async fn recording(&self, id: &str) -> Result<Option<Recording>> {
        Ok(self.recordings().await?.into_iter().find(|r| r.id == id))
    }

    /// Persist the fields of `recording`.
    async fn save(&self, recording: &Recording) -> Result<()>;

    /// Recordings paired with the rule that produced them.
    ///
    /// Recordings without a rule, or whose rule no longer exists, are left out.
    /// Stores that remember finished post-processing should leave those
    /// recordings out too; the engine only skips work it ran itself since
    /// start-up.
    async fn pending(&self) -> Result<Vec<(RecordingRule, Recording)>> {
        let rules: BTreeMap<String, RecordingRule> = self
            .recording_rules()
            .await?
            .into_iter()
            .map(|rule| (rule.id.clone(), rule))
            .collect();

        Ok(self
            .recordings()
            .await?
            .into_iter()
            .filter_map(|recording| {
                let rule = rules.get(recording.rule_id.as_deref()?)?;
                Some((rule.clone(), recording))
            })
            .collect())
    }
}

/// Process-local [`RecordingStore`].
#[derive(Debug, Default)]
pub struct InMemoryRecordingStore {
    recordings: RwLock<BTreeMap<String, Recording>>,
    rules: RwLock<BTreeMap<String, RecordingRule>>,
    saves: AtomicUsize,
}

impl InMemoryRecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_recording(&self, recording: Recording) {
        self.recordings
            .write()
            .insert(recording.id.clone(), recording);
    }

    pub fn insert_rule(&self, rule: RecordingRule) {
        self.rules.write().insert(rule.id.clone(), rule);
    }

    pub fn get(&self, id: &str) -> Option<Recording> {
        self.recordings.read().get(id).cloned()
    }

    /// Number of successful [`RecordingStore::save`] calls.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordingStore for InMemoryRecordingStore {
    async fn recordings(&self) -> Result<Vec<Recording>> {
        Ok(self.recordings.read().values().cloned().collect())
    }

    async fn recording_rules(&self) -> Result<Vec<RecordingRule>> {
        Ok(self.rules.read().values().cloned().collect())
    }

    async fn recording(&self, id: &str) -> Result<Option<Recording>> {
        Ok(self.get(id))
    }

    async fn save(&self, recording: &Recording) -> Result<()> {
        let mut recordings = self.recordings.write();
        let slot = recordings
            .get_mut(&recording.id)
            .ok_or_else(|| Error::not_found("Recording", &recording.id))?;
        *slot = recording.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        debug!(recording_id = %recording.id, "Recording saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskSetting;

    #[tokio::test]
    async fn test_pending_joins_recordings_with_rules() {
        let store = InMemoryRecordingStore::new();
        store.insert_rule(RecordingRule::new("r1", "News").with_task(TaskSetting::enabled("comskip")));
        store.insert_recording(Recording::new("a", "/rec/a.ts").with_rule("r1"));
        store.insert_recording(Recording::new("b", "/rec/b.ts").with_rule("gone"));
        store.insert_recording(Recording::new("c", "/rec/c.ts"));

        let pending = store.pending().await.unwrap();

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0.id, "r1");
        assert_eq!(pending[0].1.id, "a");
    }

    #[tokio::test]
    async fn test_save_replaces_fields() {
        let store = InMemoryRecordingStore::new();
        store.insert_recording(Recording::new("a", "/rec/a.ts"));

        let mut updated = store.get("a").unwrap();
        updated
            .metadata
            .insert("commercials".to_string(), "120-300".to_string());
        store.save(&updated).await.unwrap();

        assert_eq!(store.save_count(), 1);
        assert_eq!(
            store.get("a").unwrap().metadata.get("commercials").map(String::as_str),
            Some("120-300")
        );
    }

    #[tokio::test]
    async fn test_save_unknown_recording() {
        let store = InMemoryRecordingStore::new();
        let err = store.save(&Recording::new("x", "/rec/x.ts")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(store.save_count(), 0);
    }
}
