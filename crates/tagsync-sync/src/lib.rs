//! Reconciliation orchestration: configuration, notifications, duplicate
//! consolidation, the pass driver and its scheduler.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use tagsync_rules::YamlRuleEngine;
use tagsync_storage::{load_records_json, HttpRecordStore, InMemoryRecordStore, RecordStore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub mod config;
pub mod consolidate;
pub mod driver;
mod feedback;
pub mod notify;

pub use config::{BucketCatalog, CarryForwardRule, ConsolidationConfig, SyncConfig};
pub use consolidate::{classify_duplicate_type, plan_group, DuplicateType, GroupPlan, MemberFacts};
pub use driver::{PassDriver, PassSummary, RecordOutcome};
pub use notify::{Destination, Dispatcher, Notification, Notifier, PayloadShape, RecordingDispatcher};

pub const CRATE_NAME: &str = "tagsync-sync";

/// The remote store, or an in-memory one seeded from a JSON fixture.
pub fn build_store(config: &SyncConfig, fixture: Option<&Path>) -> Result<Arc<dyn RecordStore>> {
    match fixture {
        Some(path) => {
            let records = load_records_json(path)?;
            info!(records = records.len(), path = %path.display(), "using fixture record store");
            Ok(Arc::new(InMemoryRecordStore::with_records(records)))
        }
        None => {
            let store = HttpRecordStore::new(config.http_store_config()?)?;
            Ok(Arc::new(store))
        }
    }
}

/// Wire a driver from configuration files under the workspace root.
pub fn build_driver(
    config: &SyncConfig,
    store: Arc<dyn RecordStore>,
    cancel: Arc<AtomicBool>,
) -> Result<PassDriver> {
    let rules = YamlRuleEngine::from_workspace_root(&config.workspace_root)
        .context("loading classification rules")?;
    let consolidation = ConsolidationConfig::from_workspace_root(&config.workspace_root)?;
    let notifier = Notifier::from_config(config)?;
    if notifier.destinations().is_empty() {
        warn!("no webhook destinations configured; changes will only be recorded");
    }
    Ok(PassDriver::new(store, Arc::new(rules), notifier, consolidation).with_cancel_flag(cancel))
}

pub async fn run_pass_from_env() -> Result<PassSummary> {
    let config = SyncConfig::from_env();
    let store = build_store(&config, None)?;
    let driver = build_driver(&config, store, Arc::new(AtomicBool::new(false)))?;
    driver.run_pass(&config.record_filter()).await
}

/// Cron-driven passes when enabled. A tick that fires while the previous pass
/// is still running is skipped.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    driver: Arc<PassDriver>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let running = Arc::new(tokio::sync::Mutex::new(()));
    let filter = config.record_filter();
    let cron = config.sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let driver = Arc::clone(&driver);
        let running = Arc::clone(&running);
        let filter = filter.clone();
        Box::pin(async move {
            let Ok(_guard) = running.try_lock_owned() else {
                warn!("previous pass still running; skipping scheduled run");
                return;
            };
            match driver.run_pass(&filter).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    updated = summary.updated,
                    notified = summary.notified,
                    errored = summary.errored,
                    "scheduled pass finished"
                ),
                Err(err) => error!(error = ?err, "scheduled pass failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
