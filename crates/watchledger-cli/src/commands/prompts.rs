use crate::commands::sync_ui::is_interactive;
use crate::output::Output;
use color_eyre::Result;
use dialoguer::{Confirm, Input};
use owo_colors::OwoColorize;
use serde_json::json;
use watch_sync_sources::trakt::DeviceCode;
use watch_sync_sources::AuthPrompt;

/// Prompt for a string value with optional default
pub fn prompt_string(prompt: &str, default: Option<&str>) -> Result<String> {
    let mut input_builder = Input::<String>::new().with_prompt(prompt).allow_empty(true);

    if let Some(default_value) = default {
        input_builder = input_builder.default(default_value.to_string());
    }

    input_builder
        .interact_text()
        .map_err(|e| color_eyre::eyre::eyre!("Failed to read input: {}", e))
}

/// Prompt for a secret without echoing it
pub fn prompt_secret(prompt: &str) -> Result<String> {
    rpassword::prompt_password(format!("{}: ", prompt))
        .map(|s| s.trim().to_string())
        .map_err(|e| color_eyre::eyre::eyre!("Failed to read secret: {}", e))
}

pub fn prompt_yes_no(prompt: &str, default: bool) -> Result<bool> {
    Confirm::new()
        .with_prompt(prompt)
        .default(default)
        .interact()
        .map_err(|e| color_eyre::eyre::eyre!("Failed to read confirmation: {}", e))
}

/// Terminal side of the Trakt authorization bootstrap.
pub struct TerminalPrompt {
    output: Output,
    interactive: bool,
}

impl TerminalPrompt {
    pub fn new(output: Output) -> Self {
        Self {
            output,
            interactive: is_interactive(),
        }
    }
}

impl AuthPrompt for TerminalPrompt {
    fn show_device_code(&self, device: &DeviceCode) {
        if self.output.is_json() {
            self.output.json(&json!({
                "type": "device_code",
                "verification_url": device.verification_url,
                "user_code": device.user_code,
                "expires_in": device.expires_in,
            }));
            return;
        }
        // Shown even with --quiet; the operator has to act on it
        eprintln!();
        eprintln!("{}", "Trakt authorization required".bright_cyan().bold());
        eprintln!("  1. Open {}", device.verification_url.underline());
        eprintln!("  2. Enter the code {}", device.user_code.bright_yellow().bold());
        eprintln!("  Waiting for approval (expires in {}s)...", device.expires_in);
        eprintln!();
    }

    fn is_interactive(&self) -> bool {
        self.interactive
    }

    fn ask_authorization_code(&self, authorize_url: &str) -> Option<String> {
        eprintln!("Open this URL and approve access:");
        eprintln!("  {}", authorize_url.underline());
        prompt_string("Authorization code", None).ok().filter(|c| !c.trim().is_empty())
    }
}
