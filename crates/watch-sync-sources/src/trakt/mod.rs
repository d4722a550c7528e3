pub mod auth;
pub mod client;
pub mod history;

pub use auth::{build_authorize_url, ensure_refresh_token, AuthPrompt, DeviceCode, Grant, TraktAuth};
pub use client::{ClientSettings, TraktClient};
pub use history::parse_history_item;
