use super::prompts::{prompt_secret, prompt_string, TerminalPrompt};
use super::AppContext;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use serde_json::json;
use tracing::info;
use watch_sync_config::Config;
use watch_sync_sources::{ensure_refresh_token, ClientSettings, TraktClient};

/// Authorize against Trakt from scratch and persist the new tokens.
pub async fn run_auth(ctx: &AppContext, auth_code: Option<String>) -> Result<()> {
    let output = ctx.output;
    let mut config = ctx.config.clone();

    if config.trakt.client_id.trim().is_empty() || config.trakt.client_secret.trim().is_empty() {
        prompt_api_keys(ctx, &mut config)?;
    }

    let mut store = ctx.credential_store()?;
    store.clear();
    store
        .save()
        .map_err(|e| eyre!("Failed to save credentials to {}: {}", store.path().display(), e))?;

    let client = TraktClient::new(ClientSettings::from_config(&config), None)?;
    let code = auth_code.or_else(|| config.trakt.auth_code.clone());
    let prompt = TerminalPrompt::new(output);
    ensure_refresh_token(client.auth(), &mut store, None, code.as_deref(), &prompt)
        .await
        .wrap_err("Trakt authorization failed")?;

    let client = client.with_credentials(store);
    let username = client.fetch_username().await;

    // The client wrote rotated tokens to disk; reload before adding the name
    let mut store = ctx.credential_store()?;
    if let Some(name) = &username {
        store.set_username(name.clone());
        store
            .save()
            .map_err(|e| eyre!("Failed to save credentials to {}: {}", store.path().display(), e))?;
    }
    info!(username = ?username, "Trakt authorization stored");

    if output.is_json() {
        output.json(&json!({
            "status": "authorized",
            "username": username,
            "credentials_file": store.path().display().to_string(),
        }));
    } else {
        let who = username.as_deref().unwrap_or("unknown user");
        output.success(format!("Authorized as {}", who));
        output.info(format!("Tokens saved to {}", store.path().display()));
    }
    Ok(())
}

/// Ask for the API application keys and write them to the config file.
fn prompt_api_keys(ctx: &AppContext, config: &mut Config) -> Result<()> {
    let output = ctx.output;
    if !super::sync_ui::is_interactive() {
        return Err(eyre!(
            "Trakt client id and secret are not configured; set TRAKT_CLIENT_ID and TRAKT_CLIENT_SECRET"
        ));
    }

    output.println("Create an API application at https://trakt.tv/oauth/applications");
    output.println("and use 'urn:ietf:wg:oauth:2.0:oob' as the redirect URI.");
    output.println("");

    let client_id = prompt_string("Trakt client id", None)?;
    let client_secret = prompt_secret("Trakt client secret")?;
    if client_id.trim().is_empty() || client_secret.is_empty() {
        return Err(eyre!("Client id and secret are both required"));
    }
    config.trakt.client_id = client_id.trim().to_string();
    config.trakt.client_secret = client_secret;

    // Only persist the keys; env overrides stay out of the file
    let mut file_config = if ctx.config_path.exists() {
        Config::load_from_file(&ctx.config_path)?
    } else {
        Config::default()
    };
    file_config.trakt.client_id = config.trakt.client_id.clone();
    file_config.trakt.client_secret = config.trakt.client_secret.clone();
    file_config
        .save_to_file(&ctx.config_path)
        .wrap_err_with(|| format!("Failed to write {}", ctx.config_path.display()))?;
    output.success(format!("Saved API keys to {}", ctx.config_path.display()));
    Ok(())
}
