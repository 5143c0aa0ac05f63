//! End-to-end tests of the dual-lane scheduler.
//!
//! Most tests drive the lane pollers one tick at a time so that ordering and
//! retry counts are deterministic.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use postproc::config::{LaneConfig, PostProcConfig};
use postproc::domain::{Recording, RecordingRule, TaskSetting};
use postproc::job::{JobEvent, JobListener};
use postproc::nms::InMemoryRecordingStore;
use postproc::postproc::{LaneKind, PostProcessor, TickOutcome, WorkerRecording};
use postproc::worker::{Worker, WorkerRegistry};

/// Worker that logs which recordings it was given.
///
/// With `auto_complete` it fires `Complete` from inside `work`; otherwise the
/// test completes items by hand.
struct ScriptedWorker {
    title: &'static str,
    heavy: bool,
    auto_complete: bool,
    seen: Mutex<Vec<String>>,
    pending: Mutex<Vec<Arc<dyn JobListener>>>,
}

impl ScriptedWorker {
    fn new(title: &'static str, heavy: bool, auto_complete: bool) -> Arc<Self> {
        Arc::new(Self {
            title,
            heavy,
            auto_complete,
            seen: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }

    fn complete_oldest(&self) {
        let listener = self.pending.lock().remove(0);
        listener.on_job_event(&JobEvent::complete(self.title));
    }
}

impl Worker for ScriptedWorker {
    fn title(&self) -> &str {
        self.title
    }

    fn is_heavy(&self) -> bool {
        self.heavy
    }

    fn work(&self, recording: Arc<Recording>, listener: Arc<dyn JobListener>) {
        self.seen.lock().push(recording.id.clone());
        if self.auto_complete {
            listener.on_job_event(&JobEvent::complete(self.title));
        } else {
            self.pending.lock().push(listener);
        }
    }

    fn cancel(&self, _recording: &Recording) {}
}

struct Harness {
    dir: TempDir,
    registry: Arc<WorkerRegistry>,
    store: Arc<InMemoryRecordingStore>,
    processor: PostProcessor,
}

impl Harness {
    fn new(config: PostProcConfig, workers: &[Arc<ScriptedWorker>]) -> Self {
        let registry = Arc::new(WorkerRegistry::new());
        for worker in workers {
            registry.register(worker.clone());
        }
        let store = Arc::new(InMemoryRecordingStore::new());
        let processor = PostProcessor::new(&config, registry.clone(), store.clone());
        Self {
            dir: tempfile::tempdir().unwrap(),
            registry,
            store,
            processor,
        }
    }

    fn recording(&self, id: &str, present: bool) -> Arc<Recording> {
        let path = self.dir.path().join(format!("{id}.ts"));
        if present {
            std::fs::write(&path, b"media").unwrap();
        }
        Arc::new(Recording::new(id, path))
    }

    fn enqueue(&self, worker: &str, recording: Arc<Recording>) {
        self.processor
            .enqueue(WorkerRecording::new(worker, recording))
            .expect("worker is registered");
    }

    async fn tick(&self, kind: LaneKind) -> TickOutcome {
        self.processor.lane(kind).tick().await
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_missing_media_blocks_the_lane_until_abandoned() {
    let a = ScriptedWorker::new("workerA", false, true);
    let b = ScriptedWorker::new("workerB", false, true);
    let h = Harness::new(PostProcConfig::default(), &[a.clone(), b.clone()]);

    h.enqueue("workerA", h.recording("rec1", false));
    h.enqueue("workerB", h.recording("rec2", true));

    for attempt in 1..20 {
        assert_eq!(
            h.tick(LaneKind::Light).await,
            TickOutcome::Requeued { attempt }
        );
        assert!(b.seen().is_empty(), "rec2 dispatched while rec1 held the head");
    }
    assert_eq!(h.tick(LaneKind::Light).await, TickOutcome::Abandoned);

    assert_eq!(h.tick(LaneKind::Light).await, TickOutcome::Dispatched);
    assert_eq!(b.seen(), vec!["rec2"]);
    assert!(a.seen().is_empty());

    let stats = h.processor.stats().light;
    assert_eq!(stats.abandoned, 1);
    assert_eq!(stats.queued, 0);
}

#[tokio::test]
async fn test_dispatch_order_is_enqueue_order() {
    let worker = ScriptedWorker::new("comskip", true, true);
    let h = Harness::new(PostProcConfig::default(), &[worker.clone()]);
    let ids = ["r1", "r2", "r3", "r4", "r5"];
    for id in ids {
        h.enqueue("comskip", h.recording(id, true));
    }

    for _ in ids {
        assert_eq!(h.tick(LaneKind::Heavy).await, TickOutcome::Dispatched);
    }

    assert_eq!(worker.seen(), ids);
    assert_eq!(h.tick(LaneKind::Heavy).await, TickOutcome::Empty);
}

#[tokio::test]
async fn test_light_lane_never_runs_two_items() {
    let worker = ScriptedWorker::new("thumbnail", false, false);
    let h = Harness::new(PostProcConfig::default(), &[worker.clone()]);
    for id in ["r1", "r2", "r3"] {
        h.enqueue("thumbnail", h.recording(id, true));
    }

    assert_eq!(h.tick(LaneKind::Light).await, TickOutcome::Dispatched);
    for _ in 0..5 {
        assert_eq!(h.tick(LaneKind::Light).await, TickOutcome::NotReady);
    }
    assert_eq!(worker.seen(), vec!["r1"]);

    worker.complete_oldest();
    assert_eq!(h.tick(LaneKind::Light).await, TickOutcome::Dispatched);
    assert_eq!(h.tick(LaneKind::Light).await, TickOutcome::NotReady);
    assert_eq!(worker.seen(), vec!["r1", "r2"]);
    assert_eq!(h.processor.lane(LaneKind::Light).in_flight(), 1);
}

#[tokio::test]
async fn test_retry_budget_is_configurable() {
    let worker = ScriptedWorker::new("comskip", true, true);
    let config = PostProcConfig {
        heavy_lane: LaneConfig {
            max_retries: 5,
            ..LaneConfig::default()
        },
        ..PostProcConfig::default()
    };
    let h = Harness::new(config, &[worker.clone()]);
    h.enqueue("comskip", h.recording("late", false));
    h.enqueue("comskip", h.recording("ready", true));

    let mut checks = 0;
    loop {
        checks += 1;
        match h.tick(LaneKind::Heavy).await {
            TickOutcome::Requeued { .. } => continue,
            TickOutcome::Abandoned => break,
            other => panic!("unexpected tick outcome {other:?}"),
        }
    }

    assert_eq!(checks, 5);
    assert_eq!(h.tick(LaneKind::Heavy).await, TickOutcome::Dispatched);
    assert_eq!(worker.seen(), vec!["ready"]);
}

#[tokio::test]
async fn test_media_appearing_during_retries_is_dispatched() {
    let worker = ScriptedWorker::new("comskip", true, true);
    let h = Harness::new(PostProcConfig::default(), &[worker.clone()]);
    let recording = h.recording("growing", false);
    h.enqueue("comskip", recording.clone());

    assert_eq!(
        h.tick(LaneKind::Heavy).await,
        TickOutcome::Requeued { attempt: 1 }
    );
    std::fs::write(&recording.path, b"media").unwrap();

    assert_eq!(h.tick(LaneKind::Heavy).await, TickOutcome::Dispatched);
    assert_eq!(worker.seen(), vec!["growing"]);
}

#[tokio::test]
async fn test_completion_saves_recording_once_when_requested() {
    let worker = ScriptedWorker::new("comskip", true, true);
    let h = Harness::new(PostProcConfig::default(), &[worker.clone()]);
    let recording = h.recording("r1", true);
    h.store.insert_recording(recording.as_ref().clone());

    let rule = RecordingRule::new("rule", "News")
        .with_task(TaskSetting::enabled("comskip"))
        .with_update_recording(true);
    assert_eq!(h.processor.schedule(&rule, recording), 1);
    assert_eq!(h.tick(LaneKind::Heavy).await, TickOutcome::Dispatched);

    eventually(|| h.store.save_count() >= 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.store.save_count(), 1);
}

/// Completes with a copy of the recording carrying one extra metadata field.
struct TaggingWorker {
    pending: Mutex<Vec<(Arc<Recording>, Arc<dyn JobListener>)>>,
}

impl TaggingWorker {
    fn finish_all(&self) {
        for (recording, listener) in self.pending.lock().drain(..) {
            let mut tagged = recording.as_ref().clone();
            tagged
                .metadata
                .insert("commercials".to_string(), "120-300".to_string());
            listener.on_job_event(&JobEvent::complete("comskip").with_recording(Arc::new(tagged)));
        }
    }
}

impl Worker for TaggingWorker {
    fn title(&self) -> &str {
        "comskip"
    }

    fn is_heavy(&self) -> bool {
        true
    }

    fn work(&self, recording: Arc<Recording>, listener: Arc<dyn JobListener>) {
        self.pending.lock().push((recording, listener));
    }

    fn cancel(&self, _recording: &Recording) {}
}

#[tokio::test]
async fn test_completion_save_merges_into_current_store_copy() {
    let registry = Arc::new(WorkerRegistry::new());
    let worker = Arc::new(TaggingWorker {
        pending: Mutex::new(Vec::new()),
    });
    registry.register(worker.clone());
    let store = Arc::new(InMemoryRecordingStore::new());
    let processor = PostProcessor::new(&PostProcConfig::default(), registry, store.clone());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("r1.ts");
    std::fs::write(&path, b"media").unwrap();
    let recording = Recording::new("r1", &path).with_title("News");
    store.insert_recording(recording.clone());

    let rule = RecordingRule::new("rule", "News")
        .with_task(TaskSetting::enabled("comskip"))
        .with_update_recording(true);
    assert_eq!(processor.schedule(&rule, Arc::new(recording)), 1);

    // The store moves on after the item was queued.
    let mut edited = store.get("r1").unwrap().with_title("News at Ten");
    edited
        .metadata
        .insert("chapters".to_string(), "6".to_string());
    store.insert_recording(edited);

    assert_eq!(
        processor.lane(LaneKind::Heavy).tick().await,
        TickOutcome::Dispatched
    );
    worker.finish_all();
    eventually(|| store.save_count() >= 1).await;

    let saved = store.get("r1").unwrap();
    assert_eq!(saved.title, "News at Ten");
    assert_eq!(saved.metadata.get("chapters").map(String::as_str), Some("6"));
    assert_eq!(
        saved.metadata.get("commercials").map(String::as_str),
        Some("120-300")
    );
}

#[tokio::test]
async fn test_sync_does_not_rerun_dispatched_or_finished_work() {
    let worker = ScriptedWorker::new("comskip", true, false);
    let h = Harness::new(PostProcConfig::default(), &[worker.clone()]);
    let rule = RecordingRule::new("rule", "News").with_task(TaskSetting::enabled("comskip"));
    h.store.insert_rule(rule);
    let recording = h.recording("r1", true);
    h.store
        .insert_recording(recording.as_ref().clone().with_rule("rule"));

    assert_eq!(h.processor.sync_pending().await.unwrap(), 1);
    assert_eq!(h.tick(LaneKind::Heavy).await, TickOutcome::Dispatched);
    assert_eq!(h.processor.sync_pending().await.unwrap(), 0);
    assert_eq!(h.processor.stats().heavy.queued, 0);

    worker.complete_oldest();
    assert_eq!(h.processor.sync_pending().await.unwrap(), 0);
    assert_eq!(h.tick(LaneKind::Heavy).await, TickOutcome::Empty);
    assert_eq!(worker.seen(), vec!["r1"]);
}

#[tokio::test]
async fn test_departed_worker_with_missing_media_is_skipped_at_once() {
    let gone = ScriptedWorker::new("chapters", false, true);
    let stays = ScriptedWorker::new("thumbnail", false, true);
    let h = Harness::new(PostProcConfig::default(), &[gone.clone(), stays.clone()]);
    h.enqueue("chapters", h.recording("never", false));
    h.enqueue("thumbnail", h.recording("r2", true));
    assert!(h.registry.deregister("chapters").is_some());

    assert_eq!(h.tick(LaneKind::Light).await, TickOutcome::Skipped);
    assert_eq!(h.tick(LaneKind::Light).await, TickOutcome::Dispatched);
    assert_eq!(stays.seen(), vec!["r2"]);
    let stats = h.processor.stats().light;
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.abandoned, 0);
}

#[tokio::test]
async fn test_completion_without_update_does_not_save() {
    let worker = ScriptedWorker::new("comskip", true, true);
    let h = Harness::new(PostProcConfig::default(), &[worker.clone()]);
    let recording = h.recording("r1", true);
    h.store.insert_recording(recording.as_ref().clone());

    let rule = RecordingRule::new("rule", "News").with_task(TaskSetting::enabled("comskip"));
    h.processor.schedule(&rule, recording);
    assert_eq!(h.tick(LaneKind::Heavy).await, TickOutcome::Dispatched);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.store.save_count(), 0);
}

#[tokio::test]
async fn test_departed_worker_is_skipped() {
    let gone = ScriptedWorker::new("chapters", false, true);
    let stays = ScriptedWorker::new("thumbnail", false, true);
    let h = Harness::new(PostProcConfig::default(), &[gone.clone(), stays.clone()]);
    h.enqueue("chapters", h.recording("r1", true));
    h.enqueue("thumbnail", h.recording("r2", true));

    assert!(h.registry.deregister("chapters").is_some());

    assert_eq!(h.tick(LaneKind::Light).await, TickOutcome::Skipped);
    assert_eq!(h.tick(LaneKind::Light).await, TickOutcome::Dispatched);
    assert!(gone.seen().is_empty());
    assert_eq!(stays.seen(), vec!["r2"]);
}

#[tokio::test]
async fn test_pollers_run_both_lanes() {
    let heavy = ScriptedWorker::new("comskip", true, true);
    let light = ScriptedWorker::new("thumbnail", false, true);
    let fast = LaneConfig {
        poll_interval_ms: 10,
        ..LaneConfig::default()
    };
    let config = PostProcConfig {
        heavy_lane: fast.clone(),
        light_lane: fast,
        ..PostProcConfig::default()
    };
    let h = Harness::new(config, &[heavy.clone(), light.clone()]);

    let rule = RecordingRule::new("rule", "News")
        .with_task(TaskSetting::enabled("comskip"))
        .with_task(TaskSetting::enabled("thumbnail"));
    let recording = h.recording("r1", true);
    h.store.insert_rule(rule);
    h.store
        .insert_recording(recording.as_ref().clone().with_rule("rule"));

    h.processor.start();
    assert_eq!(h.processor.sync_pending().await.unwrap(), 2);

    eventually(|| heavy.seen().len() == 1 && light.seen().len() == 1).await;
    h.processor.stop().await;

    let stats = h.processor.stats();
    assert_eq!(stats.heavy.completed, 1);
    assert_eq!(stats.light.completed, 1);
    assert!(!h.processor.is_running());
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_worker_end_to_end() {
    use postproc::config::ProcessConfig;
    use postproc::worker::{CommandWorker, CommandWorkerConfig};

    let dir = tempfile::tempdir().unwrap();
    let media = dir.path().join("The Show.ts");
    std::fs::write(&media, b"media").unwrap();

    let registry = Arc::new(WorkerRegistry::new());
    registry.register(Arc::new(CommandWorker::new(
        CommandWorkerConfig {
            title: "marker".to_string(),
            heavy: false,
            command: "touch {dir}/{stem}.done".to_string(),
            working_dir: None,
        },
        ProcessConfig::default(),
    )));
    let config = PostProcConfig {
        light_lane: LaneConfig {
            poll_interval_ms: 10,
            ..LaneConfig::default()
        },
        ..PostProcConfig::default()
    };
    let store = Arc::new(InMemoryRecordingStore::new());
    let processor = PostProcessor::new(&config, registry, store);
    processor.start();

    let rule = RecordingRule::new("rule", "All").with_task(TaskSetting::enabled("marker"));
    processor.schedule(&rule, Arc::new(Recording::new("1", &media)));

    let marker = dir.path().join("The Show.done");
    eventually(|| Path::new(&marker).exists()).await;
    eventually(|| processor.stats().light.completed == 1).await;
    processor.stop().await;

    assert!(!dir.path().join("The").exists());
    assert!(!dir.path().join("Show.done").exists());
}
