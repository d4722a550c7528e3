use super::AppContext;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use serde_json::json;
use watch_sync_models::DeadLetterEntry;

const REASON_WIDTH: usize = 60;

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(width.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

fn entry_row(entry: &DeadLetterEntry) -> Vec<String> {
    vec![
        entry.id.map(|id| id.to_string()).unwrap_or_default(),
        entry
            .history_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string()),
        entry.mode.to_string(),
        entry.first_seen_at.format("%Y-%m-%d %H:%M").to_string(),
        truncate(&entry.reason, REASON_WIDTH),
        if entry.resolved_at.is_some() { "resolved" } else { "open" }.to_string(),
    ]
}

pub fn list_dead_letters(ctx: &AppContext, include_resolved: bool, limit: usize) -> Result<()> {
    let output = ctx.output;
    let ledger = ctx.open_ledger()?;
    let entries = ledger.dead_letters(include_resolved, limit)?;

    if output.is_json() {
        output.json(&json!({ "dead_letters": entries }));
        return Ok(());
    }

    if entries.is_empty() {
        output.success("No dead letters");
        return Ok(());
    }

    output.grid(
        &["ID", "History ID", "Mode", "First seen", "Reason", "State"],
        entries.iter().map(entry_row).collect(),
    );
    output.info("Mark an entry handled with `watchledger dead-letters resolve <ID>`");
    Ok(())
}

pub fn resolve_dead_letter(ctx: &AppContext, id: i64) -> Result<()> {
    let output = ctx.output;
    let ledger = ctx.open_ledger()?;
    if !ledger.resolve_dead_letter(id)? {
        return Err(eyre!("No unresolved dead letter with id {}", id));
    }
    if output.is_json() {
        output.json(&json!({ "status": "resolved", "id": id }));
    } else {
        output.success(format!("Dead letter {} resolved", id));
    }
    Ok(())
}
