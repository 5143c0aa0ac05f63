use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use postproc::config::PostProcConfig;
use postproc::domain::{Recording, RecordingRule, TaskSetting};
use postproc::logging;
use postproc::nms::InMemoryRecordingStore;
use postproc::postproc::PostProcessor;
use postproc::worker::{CommandWorker, WorkerRegistry};

const DEFAULT_CONFIG_PATH: &str = "postproc.json";
const CATCH_ALL_RULE: &str = "default";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config_path = std::env::var("POSTPROC_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = if config_path.exists() {
        PostProcConfig::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        PostProcConfig::default()
    };
    config.apply_env()?;

    let logging = logging::init_logging(&config.log_filter, config.log_dir.as_deref())?;
    let shutdown = CancellationToken::new();
    logging.start_retention_cleanup(shutdown.clone());

    let registry = Arc::new(WorkerRegistry::new());
    let mut rule = RecordingRule::new(CATCH_ALL_RULE, "All workers").with_update_recording(true);
    for worker in &config.workers {
        registry.register(Arc::new(CommandWorker::new(
            worker.clone(),
            config.process.clone(),
        )));
        rule = rule.with_task(TaskSetting::enabled(worker.title.clone()));
    }
    if registry.is_empty() {
        warn!("No workers configured; recordings will be queued but never processed");
    }

    let store = Arc::new(InMemoryRecordingStore::new());
    store.insert_rule(rule);
    for (index, path) in std::env::args().skip(1).enumerate() {
        store.insert_recording(recording_for(index, Path::new(&path)));
    }

    let processor = PostProcessor::new(&config, registry, store);
    processor.start();

    match processor.sync_pending().await {
        Ok(queued) => info!(queued, "Queued recordings"),
        Err(e) => warn!(error = %e, "Failed to read pending recordings"),
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    info!("Shutting down");
    shutdown.cancel();
    processor.stop().await;
    info!(stats = ?processor.stats(), "Bye");
    Ok(())
}

fn recording_for(index: usize, path: &Path) -> Recording {
    Recording::new(format!("cli-{}", index + 1), path).with_rule(CATCH_ALL_RULE)
}
