use super::AppContext;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use owo_colors::OwoColorize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use watch_sync_core::{SyncError, SyncEngine};
use watch_sync_models::SyncMode;

/// Accept classic 5-field crontab lines by prepending a seconds field.
pub fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// Run one mode and log the outcome. Callers ignore the error so a broken run cannot stop the scheduler.
async fn run_logged(engine: &SyncEngine, mode: SyncMode) -> Result<(), SyncError> {
    match engine.run(mode, false).await {
        Ok(report) if report.is_skipped() => {
            info!(operation = "scheduled_sync", mode = %mode, outcome = ?report.outcome, "Run skipped");
            Ok(())
        }
        Ok(report) => {
            info!(
                operation = "scheduled_sync",
                mode = %mode,
                accepted = report.events_accepted,
                deleted = report.events_deleted,
                duration_ms = report.duration_ms,
                "Scheduled run completed"
            );
            Ok(())
        }
        Err(e) if e.is_authentication() => {
            error!(
                operation = "scheduled_sync",
                mode = %mode,
                error = %e,
                "Trakt rejected the credentials; run `watchledger auth` and restart the daemon"
            );
            Err(e)
        }
        Err(e) => {
            error!(operation = "scheduled_sync", mode = %mode, error = %e, "Scheduled run failed");
            Err(e)
        }
    }
}

async fn add_job(scheduler: &JobScheduler, expression: &str, engine: Arc<SyncEngine>, mode: SyncMode) -> Result<()> {
    let schedule = normalize_cron(expression);
    let job = Job::new_async(schedule.as_str(), move |_id, _scheduler| {
        let engine = engine.clone();
        Box::pin(async move {
            let _ = run_logged(&engine, mode).await;
        })
    })
    .map_err(|e| eyre!("Invalid cron expression '{}' for {}: {}", expression, mode, e))?;
    scheduler
        .add(job)
        .await
        .map_err(|e| eyre!("Failed to schedule {} job: {}", mode, e))?;
    info!(operation = "scheduler", mode = %mode, schedule = %schedule, "Job scheduled");
    Ok(())
}

/// Backfill when it has never completed, then catch up incrementally.
async fn startup_sync(engine: Arc<SyncEngine>) {
    match engine.ledger().get_backfill_state() {
        Ok(state) if !state.completed => {
            info!(operation = "scheduler_startup", "Running initial backfill");
            if let Err(SyncError::Cancelled) = run_logged(&engine, SyncMode::Backfill).await {
                return;
            }
        }
        Ok(_) => {}
        Err(e) => warn!(operation = "scheduler_startup", error = %e, "Could not read backfill state"),
    }
    info!(operation = "scheduler_startup", "Running startup incremental sync");
    let _ = run_logged(&engine, SyncMode::Incremental).await;
}

pub async fn run_daemon(ctx: &AppContext, no_startup_sync: bool, dry_run: bool) -> Result<()> {
    let output = ctx.output;
    let config = &ctx.config;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = match ctx.engine(dry_run).await {
        Ok(engine) => Arc::new(engine.with_shutdown(shutdown_rx)),
        Err(e) => return Err(e.wrap_err("Daemon start-up failed")),
    };

    print_header(ctx, dry_run).await;

    let mut scheduler = JobScheduler::new()
        .await
        .map_err(|e| eyre!("Failed to create scheduler: {}", e))?;
    add_job(&scheduler, &config.sync.sync_cron, engine.clone(), SyncMode::Incremental).await?;
    add_job(&scheduler, &config.sync.reconcile_cron, engine.clone(), SyncMode::Reconcile).await?;

    let startup = if no_startup_sync {
        None
    } else {
        Some(tokio::spawn(startup_sync(engine.clone())))
    };

    scheduler
        .start()
        .await
        .map_err(|e| eyre!("Failed to start scheduler: {}", e))?;
    info!(
        operation = "scheduler_started",
        sync_cron = %config.sync.sync_cron,
        reconcile_cron = %config.sync.reconcile_cron,
        dry_run,
        "Scheduler started"
    );
    output.success("Scheduler running. Press Ctrl-C to stop.");

    tokio::signal::ctrl_c().await.wrap_err("Failed to listen for Ctrl-C")?;
    info!(operation = "scheduler_shutdown", "Shutdown requested");
    let _ = shutdown_tx.send(true);

    if let Err(e) = scheduler.shutdown().await {
        warn!(operation = "scheduler_shutdown", error = %e, "Scheduler did not shut down cleanly");
    }
    if let Some(handle) = startup {
        if let Err(e) = handle.await {
            warn!(operation = "scheduler_shutdown", error = %e, "Startup sync task failed");
        }
    }

    output.success("Daemon stopped");
    Ok(())
}

async fn print_header(ctx: &AppContext, dry_run: bool) {
    let output = ctx.output;
    if output.is_quiet() || output.is_json() {
        return;
    }

    let user = ctx
        .credential_store()
        .ok()
        .and_then(|store| store.username().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());

    let influx = if dry_run {
        "dry run (exports disabled)".to_string()
    } else if !ctx.config.influx.enabled {
        "disabled".to_string()
    } else {
        let status = match ctx.influx_sink() {
            Ok(Some(sink)) => match watch_sync_core::RawSink::ping(&sink).await {
                Ok(()) => "connected".green().to_string(),
                Err(_) => "unreachable".red().to_string(),
            },
            _ => "misconfigured".red().to_string(),
        };
        format!("{} ({})", ctx.config.influx.url, status)
    };

    output.println("");
    output.table(
        &format!("watchledger v{}", env!("CARGO_PKG_VERSION")),
        &[
            ("Trakt user", user),
            ("InfluxDB", influx),
            (
                "Buckets",
                format!("{} (raw) / {} (agg)", ctx.config.influx.bucket_raw, ctx.config.influx.bucket_agg),
            ),
            ("Sync cron", ctx.config.sync.sync_cron.clone()),
            ("Reconcile cron", ctx.config.sync.reconcile_cron.clone()),
            ("State ledger", ctx.ledger_path().display().to_string()),
        ],
    );
    output.println("");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_five_field_cron_gets_seconds() {
        assert_eq!(normalize_cron("0 6,18 * * *"), "0 0 6,18 * * *");
        assert_eq!(normalize_cron(" 30 3 * * * "), "0 30 3 * * *");
    }

    #[test]
    fn test_six_field_cron_is_kept() {
        assert_eq!(normalize_cron("15 30 3 * * *"), "15 30 3 * * *");
    }

    #[test]
    fn test_default_schedules_parse() {
        for expression in ["0 6,18 * * *", "30 3 * * *"] {
            let job = Job::new_async(normalize_cron(expression).as_str(), |_id, _scheduler| Box::pin(async {}));
            assert!(job.is_ok(), "{} should parse", expression);
        }
    }
}
