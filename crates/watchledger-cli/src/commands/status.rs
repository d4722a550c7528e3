use super::AppContext;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde_json::json;
use watch_sync_models::SyncMode;

fn format_instant(instant: Option<DateTime<Utc>>) -> String {
    instant
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string())
}

pub fn run_status(ctx: &AppContext) -> Result<()> {
    let output = ctx.output;
    let ledger = ctx.open_ledger()?;
    let summary = ledger.summary()?;
    let username = ctx
        .credential_store()
        .ok()
        .and_then(|store| store.username().map(str::to_string));

    if output.is_json() {
        output.json(&json!({
            "ledger": summary,
            "username": username,
            "config_file": ctx.config_path.display().to_string(),
            "state_db": ctx.ledger_path().display().to_string(),
        }));
        return Ok(());
    }

    let mut rows = vec![
        ("Trakt user", username.unwrap_or_else(|| "not authorized".to_string())),
        ("Accepted events", summary.accepted_events.to_string()),
        ("Oldest watch", format_instant(summary.oldest_watched_at)),
        ("Newest watch", format_instant(summary.newest_watched_at)),
        (
            "Backfill",
            if summary.backfill.completed {
                format!("completed {}", format_instant(summary.backfill.completed_at))
            } else {
                "pending".to_string()
            },
        ),
    ];
    for cursor in &summary.cursors {
        let label = match cursor.mode {
            SyncMode::Backfill => "Backfill cursor",
            SyncMode::Incremental => "Incremental cursor",
            SyncMode::Reconcile => "Reconcile cursor",
        };
        rows.push((label, format_instant(Some(cursor.last_successful_at))));
    }
    rows.push(("Unresolved dead letters", summary.unresolved_dead_letters.to_string()));
    rows.push(("Config file", ctx.config_path.display().to_string()));
    rows.push(("State ledger", ctx.ledger_path().display().to_string()));

    output.table("watchledger status", &rows);
    Ok(())
}
