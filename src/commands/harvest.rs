//! Harvest commands: one-off runs, run logs, and the scheduler loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use harvester_core::service::HarvestService;
use harvester_core::store::HarvestRun;
use tracing::{info, warn};

use crate::cli::{LogsArgs, ServeArgs};

pub async fn run_harvest_command(service: &HarvestService, source_id: i64) -> Result<()> {
    let controller = Arc::clone(service.controller());
    let signal_controller = Arc::clone(&controller);
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing the current page");
            signal_controller.request_shutdown();
        }
    });

    let outcome = service.trigger_harvest(source_id).await;
    signal.abort();
    let outcome = outcome?;

    let counts = outcome.counts;
    println!(
        "Run {} {}: {} processed, {} added, {} updated, {} failed across {} page(s)",
        outcome.run_id,
        outcome.status.as_str(),
        counts.processed,
        counts.added,
        counts.updated,
        counts.failed,
        outcome.pages
    );
    if let Some(message) = &outcome.error_message {
        if controller.shutdown_flag().load(std::sync::atomic::Ordering::SeqCst) {
            println!("Interrupted. Run again to resume from the saved position.");
            return Ok(());
        }
        bail!("harvest of source {source_id} failed: {message}");
    }
    Ok(())
}

pub async fn run_logs_command(service: &HarvestService, args: &LogsArgs) -> Result<()> {
    let page = service
        .harvest_logs(args.source_id, args.page, args.limit)
        .await?;
    if page.runs.is_empty() {
        println!("No runs recorded for source {}.", args.source_id);
        return Ok(());
    }
    for run in &page.runs {
        println!("{}", render_run_row(run));
    }
    println!("Page {} ({} runs in total).", page.page, page.total);
    Ok(())
}

pub async fn run_serve_command(service: &HarvestService, args: &ServeArgs) -> Result<()> {
    let scheduler = service.scheduler();
    let count = scheduler
        .start()
        .await
        .context("Failed to schedule harvest sources")?;
    println!("Scheduled {count} source(s). Press Ctrl-C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    let remaining = scheduler
        .shutdown(Duration::from_secs(args.grace_secs))
        .await;
    if remaining > 0 {
        warn!(remaining, "Runs still in flight at shutdown; they will resume on next start");
    }
    Ok(())
}

fn render_run_row(run: &HarvestRun) -> String {
    let finished = run
        .completed_at
        .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string());
    let mut row = format!(
        "{:>5}  {:<9} started {}  finished {}  processed {} added {} updated {} failed {}",
        run.id,
        run.status.as_str(),
        run.started_at.format("%Y-%m-%d %H:%M:%S"),
        finished,
        run.counts.processed,
        run.counts.added,
        run.counts.updated,
        run.counts.failed
    );
    if let Some(message) = &run.error_message {
        row.push_str("  error: ");
        row.push_str(message);
    }
    row
}
