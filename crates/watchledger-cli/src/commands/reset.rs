use super::prompts::prompt_yes_no;
use super::sync_ui::is_interactive;
use super::AppContext;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use serde_json::json;
use tracing::warn;

/// Wipe the state ledger. Trakt credentials are left alone.
pub fn run_reset(ctx: &AppContext, yes: bool) -> Result<()> {
    let output = ctx.output;
    let path = ctx.ledger_path();

    if !yes {
        if !is_interactive() {
            return Err(eyre!("Refusing to reset state without confirmation; pass --yes"));
        }
        output.warn(format!(
            "This deletes all cursors, accepted events and dead letters in {}",
            path.display()
        ));
        output.warn("The next sync will run a full backfill.");
        if !prompt_yes_no("Reset the state ledger?", false)? {
            output.info("Reset cancelled");
            return Ok(());
        }
    }

    let ledger = ctx.open_ledger()?;
    ledger.reset_all()?;
    warn!(operation = "reset_state", path = %path.display(), "State ledger wiped");

    if output.is_json() {
        output.json(&json!({ "status": "reset", "state_db": path.display().to_string() }));
    } else {
        output.success("State ledger reset; credentials were kept");
    }
    Ok(())
}
