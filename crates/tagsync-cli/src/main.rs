use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tagsync_sync::{build_driver, build_store, maybe_build_scheduler, PassSummary, SyncConfig};
use tokio::sync::Notify;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "tagsync")]
#[command(about = "Reconcile bot-maintained labels and metadata on remote records")]
struct Cli {
    /// Read records from a JSON fixture instead of the remote store.
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One full pass over every record.
    Run,
    /// Reconcile a single record, as a webhook handler would.
    Process { id: String },
    /// Keep running passes until interrupted.
    Daemon {
        /// Pause between passes when the cron scheduler is disabled.
        #[arg(long, default_value_t = 600)]
        interval_secs: u64,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn print_summary(summary: &PassSummary) {
    println!(
        "pass complete: run_id={} processed={} updated={} notified={} errored={} entities={} duplicates={} three_plus={}{}",
        summary.run_id,
        summary.processed,
        summary.updated,
        summary.notified,
        summary.errored,
        summary.unique_entities,
        summary.entities_with_duplicates,
        summary.entities_with_3_plus,
        if summary.cancelled { " (cancelled)" } else { "" },
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    info!(
        component = tagsync_sync::CRATE_NAME,
        api_url = %config.api_url,
        fixture = ?cli.fixture,
        "starting"
    );

    let cancel = Arc::new(AtomicBool::new(false));
    let shutdown = Arc::new(Notify::new());
    {
        let cancel = Arc::clone(&cancel);
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; stopping after the current record");
                cancel.store(true, Ordering::SeqCst);
                shutdown.notify_one();
            }
        });
    }

    let store = build_store(&config, cli.fixture.as_deref())?;
    let driver = Arc::new(build_driver(&config, store, Arc::clone(&cancel))?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = driver.run_pass(&config.record_filter()).await?;
            print_summary(&summary);
        }
        Commands::Process { id } => {
            let summary = driver.process_one(&id).await?;
            print_summary(&summary);
        }
        Commands::Daemon { interval_secs } => {
            if let Some(mut sched) = maybe_build_scheduler(&config, Arc::clone(&driver)).await? {
                sched.start().await?;
                info!(cron = %config.sync_cron, "scheduler started");
                shutdown.notified().await;
                sched.shutdown().await?;
                return Ok(());
            }

            let filter = config.record_filter();
            let pause = Duration::from_secs(interval_secs);
            while !cancel.load(Ordering::SeqCst) {
                let summary = driver.run_pass(&filter).await?;
                print_summary(&summary);
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown.notified() => break,
                }
            }
        }
    }

    Ok(())
}
