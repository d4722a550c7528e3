use crate::error::{ClientError, ClientResult};
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};
use watch_sync_config::{CredentialStore, TokenSet};

pub const REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";
pub const AUTHORIZE_URL: &str = "https://trakt.tv/oauth/authorize";

const SLOW_DOWN_STEP_SECS: u64 = 5;
const MAX_POLL_INTERVAL_SECS: u64 = 30;
const DETAIL_LIMIT: usize = 512;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

/// Device code issued by `/oauth/device/code`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DeviceCode {
    pub device_code: String,
    pub user_code: String,
    pub verification_url: String,
    #[serde(default = "default_device_expires_in")]
    pub expires_in: u64,
    #[serde(default = "default_device_interval")]
    pub interval: u64,
}

fn default_device_expires_in() -> u64 {
    600
}

fn default_device_interval() -> u64 {
    5
}

#[derive(Debug, Clone, PartialEq)]
pub enum Grant {
    AuthorizationCode(String),
    DeviceFlow,
}

/// Operator-facing side of the bootstrap: shows device codes and, when a
/// terminal is attached, asks for an authorization code.
pub trait AuthPrompt: Send + Sync {
    fn show_device_code(&self, device: &DeviceCode);

    fn is_interactive(&self) -> bool;

    /// Ask the operator to paste the code shown after visiting `authorize_url`.
    fn ask_authorization_code(&self, authorize_url: &str) -> Option<String>;
}

/// OAuth endpoints of one Trakt application.
#[derive(Debug, Clone)]
pub struct TraktAuth {
    http: Client,
    api_base_url: String,
    client_id: String,
    client_secret: String,
}

impl TraktAuth {
    pub fn new(http: Client, api_base_url: &str, client_id: &str, client_secret: &str) -> Self {
        Self {
            http,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        }
    }

    pub fn authorize_url(&self) -> String {
        build_authorize_url(&self.client_id)
    }

    /// Exchange a refresh token for a new pair. Trakt rotates the refresh
    /// token on every call, so the returned set must replace the old one.
    pub async fn refresh(&self, refresh_token: &str) -> ClientResult<TokenSet> {
        let payload = serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": self.client_id,
            "client_secret": self.client_secret,
            "redirect_uri": REDIRECT_URI,
        });
        let response = self
            .http
            .post(format!("{}/oauth/token", self.api_base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ClientError::Network(format!("token refresh failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Authentication(
                "token refresh rejected; the refresh token may be invalid or revoked".to_string(),
            ));
        }
        if !status.is_success() {
            return Err(http_error(response).await);
        }

        let token: TokenResponse = response.json().await?;
        Ok(token_set(token, refresh_token))
    }

    pub async fn exchange_code(&self, code: &str) -> ClientResult<TokenSet> {
        let payload = serde_json::json!({
            "grant_type": "authorization_code",
            "code": code.trim(),
            "client_id": self.client_id,
            "client_secret": self.client_secret,
            "redirect_uri": REDIRECT_URI,
        });
        let response = self
            .http
            .post(format!("{}/oauth/token", self.api_base_url))
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let detail = excerpt(&response.text().await.unwrap_or_default());
            return Err(ClientError::Authentication(format!(
                "authorization code exchange failed: status {}, detail {}",
                status, detail
            )));
        }

        let token: TokenResponse = response.json().await?;
        if token.refresh_token.as_deref().map_or(true, str::is_empty) {
            return Err(ClientError::Authentication(
                "authorization code exchange did not return a refresh token".to_string(),
            ));
        }
        Ok(token_set(token, ""))
    }

    pub async fn request_device_code(&self) -> ClientResult<DeviceCode> {
        let response = self
            .http
            .post(format!("{}/oauth/device/code", self.api_base_url))
            .json(&serde_json::json!({ "client_id": self.client_id }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(http_error(response).await);
        }
        let device: DeviceCode = response
            .json()
            .await
            .map_err(|e| ClientError::Decode(format!("device code response: {}", e)))?;
        if device.device_code.is_empty() || device.user_code.is_empty() || device.verification_url.is_empty() {
            return Err(ClientError::Decode("device code response missing required fields".to_string()));
        }
        Ok(device)
    }

    /// Poll until the operator approves the device code, it expires, or it is denied.
    pub async fn poll_device_token(&self, device: &DeviceCode) -> ClientResult<TokenSet> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(device.expires_in);
        let mut interval = device.interval.max(1);
        let mut poll_attempt = 0u32;

        while tokio::time::Instant::now() < deadline {
            poll_attempt += 1;
            tokio::time::sleep(Duration::from_secs(interval)).await;

            let response = self
                .http
                .post(format!("{}/oauth/device/token", self.api_base_url))
                .json(&serde_json::json!({
                    "code": device.device_code,
                    "client_id": self.client_id,
                    "client_secret": self.client_secret,
                }))
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                let token: TokenResponse = response.json().await?;
                if token.refresh_token.as_deref().map_or(true, str::is_empty) {
                    return Err(ClientError::Authentication(
                        "device token response missing refresh_token".to_string(),
                    ));
                }
                info!(poll_attempt, "Device authorization confirmed");
                return Ok(token_set(token, ""));
            }

            let header_error = response
                .headers()
                .get("X-Error-Type")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.text().await.unwrap_or_default();
            let error_code = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .or(header_error)
                .unwrap_or_else(|| "unknown_error".to_string());
            debug!(status = status.as_u16(), error = %error_code, poll_attempt, "Device token poll");

            match (status.as_u16(), error_code.as_str()) {
                (400, "authorization_pending") | (400, "unknown_error") => continue,
                (400, "slow_down") | (429, _) => {
                    interval = (interval + SLOW_DOWN_STEP_SECS).min(MAX_POLL_INTERVAL_SECS);
                    info!(poll_interval_secs = interval, "Device token polling slowed down");
                }
                (400, "expired_token") | (410, _) => {
                    return Err(ClientError::Authentication("device code expired".to_string()));
                }
                (400, "access_denied") | (418, _) => {
                    return Err(ClientError::Authentication("device authorization denied".to_string()));
                }
                (code, _) => {
                    return Err(ClientError::Authentication(format!(
                        "device token polling failed: status {}, detail {}",
                        code,
                        excerpt(&body)
                    )));
                }
            }
        }

        Err(ClientError::Authentication(
            "device authorization timed out before approval".to_string(),
        ))
    }

    pub async fn authorize(&self, grant: Grant, prompt: &dyn AuthPrompt) -> ClientResult<TokenSet> {
        match grant {
            Grant::AuthorizationCode(code) => self.exchange_code(&code).await,
            Grant::DeviceFlow => {
                let device = self.request_device_code().await?;
                warn!(
                    verification_url = %device.verification_url,
                    user_code = %device.user_code,
                    expires_in = device.expires_in,
                    "Trakt device authorization required"
                );
                prompt.show_device_code(&device);
                self.poll_device_token(&device).await
            }
        }
    }
}

pub fn build_authorize_url(client_id: &str) -> String {
    format!(
        "{}?response_type=code&client_id={}&redirect_uri={}",
        AUTHORIZE_URL,
        urlencoding::encode(client_id),
        urlencoding::encode(REDIRECT_URI)
    )
}

/// Find a usable refresh token, bootstrapping one if necessary.
///
/// Precedence: credential store, configured seed token, authorization code,
/// device flow, then an interactive code prompt. Whatever route succeeds is
/// persisted to the credential store before returning.
pub async fn ensure_refresh_token(
    auth: &TraktAuth,
    store: &mut CredentialStore,
    seed_refresh_token: Option<&str>,
    auth_code: Option<&str>,
    prompt: &dyn AuthPrompt,
) -> ClientResult<String> {
    if let Some(persisted) = store.refresh_token() {
        return Ok(persisted.to_string());
    }

    if let Some(seed) = seed_refresh_token.map(str::trim).filter(|s| !s.is_empty()) {
        store.set_refresh_token(seed.to_string());
        persist(store)?;
        return Ok(seed.to_string());
    }

    if let Some(code) = auth_code.map(str::trim).filter(|s| !s.is_empty()) {
        let tokens = auth.authorize(Grant::AuthorizationCode(code.to_string()), prompt).await?;
        return store_tokens(store, &tokens);
    }

    match auth.authorize(Grant::DeviceFlow, prompt).await {
        Ok(tokens) => {
            info!("Trakt device authorization completed");
            return store_tokens(store, &tokens);
        }
        Err(e) => warn!(error = %e, "Trakt device authorization failed"),
    }

    let authorize_url = auth.authorize_url();
    if !prompt.is_interactive() {
        return Err(ClientError::Authentication(format!(
            "no refresh token available and device flow failed; provide TRAKT_REFRESH_TOKEN or TRAKT_AUTH_CODE (authorize at {})",
            authorize_url
        )));
    }

    let code = prompt
        .ask_authorization_code(&authorize_url)
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ClientError::Authentication("no authorization code provided".to_string()))?;
    let tokens = auth.authorize(Grant::AuthorizationCode(code), prompt).await?;
    info!("Trakt authorization completed");
    store_tokens(store, &tokens)
}

fn store_tokens(store: &mut CredentialStore, tokens: &TokenSet) -> ClientResult<String> {
    store.set_tokens(tokens);
    persist(store)?;
    Ok(tokens.refresh_token.clone())
}

fn persist(store: &CredentialStore) -> ClientResult<()> {
    store
        .save()
        .map_err(|e| ClientError::Authentication(format!("failed to persist credentials: {}", e)))
}

fn token_set(token: TokenResponse, previous_refresh: &str) -> TokenSet {
    let expires_in = token.expires_in.unwrap_or(3600).max(0);
    TokenSet {
        access_token: token.access_token,
        refresh_token: token
            .refresh_token
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| previous_refresh.to_string()),
        expires_at: Utc::now() + ChronoDuration::seconds(expires_in),
    }
}

async fn http_error(response: reqwest::Response) -> ClientError {
    let status = response.status().as_u16();
    let request_id = request_id(&response);
    let detail = excerpt(&response.text().await.unwrap_or_default());
    ClientError::Http {
        status,
        request_id,
        detail,
    }
}

pub(crate) fn request_id(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get("X-Request-Id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

pub(crate) fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    trimmed.chars().take(DETAIL_LIMIT).collect()
}
