use super::sync_ui::SyncUI;
use super::AppContext;
use crate::output::Output;
use color_eyre::Result;
use watch_sync_core::{SyncError, SyncOutcome, SyncReport};
use watch_sync_models::SyncMode;

pub async fn run_sync(ctx: &AppContext, mode: SyncMode, force: bool, dry_run: bool) -> Result<()> {
    tracing::debug!(mode = %mode, force, dry_run, "Sync command started");
    let output = ctx.output;

    let ui = SyncUI::new(mode.as_str(), output.is_quiet() || output.is_json());
    let engine = ctx.engine(dry_run).await?.with_progress(ui.callback());

    match engine.run(mode, force).await {
        Ok(report) => {
            ui.finish(&report);
            print_report(&report, &output);
            Ok(())
        }
        Err(e) => {
            ui.abandon();
            handle_sync_error(ctx, &e)?;
            Err(e.into())
        }
    }
}

/// Operator hints for failures that need manual action.
pub fn handle_sync_error(ctx: &AppContext, err: &SyncError) -> Result<()> {
    if err.is_authentication() {
        // The stored token was rejected; force a fresh authorization next time
        ctx.forget_tokens()?;
        ctx.output
            .error("Trakt rejected the stored credentials. Run `watchledger auth` to authorize again.");
    }
    Ok(())
}

pub fn print_report(report: &SyncReport, output: &Output) {
    if output.is_json() {
        output.json(&serde_json::to_value(report).unwrap_or_default());
        return;
    }

    if let SyncOutcome::Skipped(reason) = &report.outcome {
        output.warn(format!("{} skipped: {}", report.mode, reason));
        return;
    }

    output.table(
        &format!("{} sync", report.mode),
        &[
            ("Window", report.window.to_string()),
            ("Pages", report.pages.to_string()),
            ("Fetched", report.events_fetched.to_string()),
            ("Accepted", report.events_accepted.to_string()),
            ("Duplicates skipped", report.duplicates_skipped.to_string()),
            ("Dead letters", report.dead_letters.to_string()),
            ("Deleted upstream", report.events_deleted.to_string()),
            ("Days rebuilt", report.days_rebuilt.to_string()),
        ],
    );
    let suffix = if report.dry_run { " (dry run, nothing exported)" } else { "" };
    output.success(format!(
        "{} completed in {:.1}s{}",
        report.mode,
        report.duration_ms as f64 / 1000.0,
        suffix
    ));
    if report.dead_letters > 0 {
        output.warn(format!(
            "{} item(s) could not be parsed; inspect them with `watchledger dead-letters`",
            report.dead_letters
        ));
    }
}
