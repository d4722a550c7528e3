use crate::error::{ClientError, ClientResult};
use crate::retry::{RetryDecision, RetryPolicy, RetryState, TransientFailure};
use crate::traits::{HistoryPage, HistorySource};
use crate::trakt::auth::{excerpt, request_id, TraktAuth};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use watch_sync_config::{Config, CredentialStore, TokenSet};
use watch_sync_models::HistoryWindow;

const PROACTIVE_REFRESH_SECS: i64 = 60;

/// Immutable settings for one client instance.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub client_id: String,
    pub client_secret: String,
    pub api_base_url: String,
    pub page_size: u32,
    pub retry: RetryPolicy,
    pub min_request_interval: Duration,
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl ClientSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            client_id: config.trakt.client_id.clone(),
            client_secret: config.trakt.client_secret.clone(),
            api_base_url: config.trakt.api_base_url.trim_end_matches('/').to_string(),
            page_size: config.trakt.page_size.max(1),
            retry: RetryPolicy {
                max_retries: config.runtime.max_retries,
                retry_after_margin: Duration::from_secs_f64(config.runtime.retry_after_margin_secs.max(0.0)),
            },
            min_request_interval: Duration::from_secs_f64(config.runtime.min_request_interval_secs.max(0.0)),
            request_timeout: Duration::from_secs(config.runtime.request_timeout_secs.max(1)),
            user_agent: default_user_agent(),
        }
    }
}

pub fn default_user_agent() -> String {
    format!("watchledger/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Default)]
struct TokenState {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl TokenState {
    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match (&self.access_token, self.expires_at) {
            (Some(_), Some(expires_at)) => now + ChronoDuration::seconds(PROACTIVE_REFRESH_SECS) >= expires_at,
            _ => true,
        }
    }
}

/// Trakt API client with retry, pacing and token refresh built in.
pub struct TraktClient {
    http: Client,
    settings: ClientSettings,
    auth: TraktAuth,
    tokens: Mutex<TokenState>,
    last_request: Mutex<Option<Instant>>,
    credentials: Option<StdMutex<CredentialStore>>,
}

impl TraktClient {
    pub fn new(settings: ClientSettings, refresh_token: Option<String>) -> ClientResult<Self> {
        let http = Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|e| ClientError::Network(format!("failed to build HTTP client: {}", e)))?;
        let auth = TraktAuth::new(http.clone(), &settings.api_base_url, &settings.client_id, &settings.client_secret);

        Ok(Self {
            http,
            settings,
            auth,
            tokens: Mutex::new(TokenState {
                refresh_token,
                ..TokenState::default()
            }),
            last_request: Mutex::new(None),
            credentials: None,
        })
    }

    /// Seed tokens from the store and write rotated tokens back to it.
    pub fn with_credentials(mut self, store: CredentialStore) -> Self {
        let state = self.tokens.get_mut();
        if let Some(tokens) = store.token_set() {
            state.access_token = Some(tokens.access_token);
            state.expires_at = Some(tokens.expires_at);
            state.refresh_token = Some(tokens.refresh_token);
        } else if let Some(refresh) = store.refresh_token() {
            state.refresh_token = Some(refresh.to_string());
        }
        self.credentials = Some(StdMutex::new(store));
        self
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn auth(&self) -> &TraktAuth {
        &self.auth
    }

    pub async fn current_refresh_token(&self) -> Option<String> {
        self.tokens.lock().await.refresh_token.clone()
    }

    /// Force a refresh, rotating the refresh token.
    pub async fn refresh_token(&self) -> ClientResult<TokenSet> {
        let mut state = self.tokens.lock().await;
        self.refresh_locked(&mut state).await
    }

    async fn refresh_locked(&self, state: &mut TokenState) -> ClientResult<TokenSet> {
        let refresh_token = state.refresh_token.clone().ok_or_else(|| {
            ClientError::Authentication("Trakt refresh token is missing; run `watchledger auth` first".to_string())
        })?;

        let tokens = self.auth.refresh(&refresh_token).await?;
        state.access_token = Some(tokens.access_token.clone());
        state.refresh_token = Some(tokens.refresh_token.clone());
        state.expires_at = Some(tokens.expires_at);
        debug!(expires_at = %tokens.expires_at, "Refreshed Trakt access token");
        self.persist_tokens(&tokens);
        Ok(tokens)
    }

    fn persist_tokens(&self, tokens: &TokenSet) {
        let Some(credentials) = &self.credentials else {
            return;
        };
        match credentials.lock() {
            Ok(mut store) => {
                store.set_tokens(tokens);
                if let Err(e) = store.save() {
                    warn!(error = %e, "Failed to persist rotated Trakt tokens");
                }
            }
            Err(_) => warn!("Credential store lock poisoned; rotated Trakt tokens not persisted"),
        }
    }

    async fn access_token(&self) -> ClientResult<String> {
        let mut state = self.tokens.lock().await;
        if state.needs_refresh(Utc::now()) {
            self.refresh_locked(&mut state).await?;
        }
        state
            .access_token
            .clone()
            .ok_or_else(|| ClientError::Authentication("missing Trakt access token".to_string()))
    }

    async fn pace(&self) {
        if self.settings.min_request_interval.is_zero() {
            return;
        }
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let next_allowed = previous + self.settings.min_request_interval;
            if next_allowed > Instant::now() {
                tokio::time::sleep_until(next_allowed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Authenticated GET with the retry policy applied.
    async fn get(&self, path: &str, query: &[(&str, String)]) -> ClientResult<Response> {
        let url = format!("{}{}", self.settings.api_base_url, path);
        let mut retry = RetryState::new(self.settings.retry);
        let mut refreshed_after_401 = false;

        loop {
            let token = self.access_token().await?;
            self.pace().await;

            let result = self
                .http
                .get(&url)
                .query(query)
                .header("Content-Type", "application/json")
                .header("trakt-api-key", &self.settings.client_id)
                .header("trakt-api-version", "2")
                .bearer_auth(&token)
                .send()
                .await;

            let (failure, error) = match result {
                Err(e) => (TransientFailure::Network, ClientError::Network(e.to_string())),
                Ok(response) => {
                    let status = response.status();
                    let request_id = request_id(&response);

                    if status == StatusCode::UNAUTHORIZED {
                        if refreshed_after_401 {
                            return Err(ClientError::Authentication(
                                "request rejected with 401 after token refresh".to_string(),
                            ));
                        }
                        refreshed_after_401 = true;
                        warn!(path, request_id = ?request_id, "Trakt returned 401, refreshing token");
                        self.refresh_token().await?;
                        continue;
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let retry_after = response
                            .headers()
                            .get("Retry-After")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        let retry_after_secs = crate::retry::parse_retry_after(retry_after.as_deref());
                        (
                            TransientFailure::RateLimited { retry_after },
                            ClientError::RateLimited { retry_after_secs },
                        )
                    } else if status.is_server_error() {
                        (
                            TransientFailure::Server { status: status.as_u16() },
                            ClientError::Server {
                                status: status.as_u16(),
                                request_id,
                            },
                        )
                    } else if status.is_client_error() {
                        let detail = excerpt(&response.text().await.unwrap_or_default());
                        return Err(ClientError::Http {
                            status: status.as_u16(),
                            request_id,
                            detail,
                        });
                    } else {
                        return Ok(response);
                    }
                }
            };

            match retry.on_failure(&failure) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        path,
                        attempt = retry.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying Trakt request"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => return Err(error),
            }
        }
    }

    pub async fn fetch_page(&self, window: &HistoryWindow, page: u32) -> ClientResult<HistoryPage> {
        let limit = self.settings.page_size;
        let mut query = vec![
            ("page", page.to_string()),
            ("limit", limit.to_string()),
            ("extended", "full".to_string()),
        ];
        if let Some(start) = window.start_at {
            query.push(("start_at", format_timestamp(start)));
        }
        if let Some(end) = window.end_at {
            query.push(("end_at", format_timestamp(end)));
        }

        let response = self.get("/sync/history", &query).await?;
        let page_count = header_number(&response, "X-Pagination-Page-Count").map(|c| c.max(1) as u32);
        let item_count = header_number(&response, "X-Pagination-Item-Count");

        let body: Value = response.json().await?;
        let items = match body {
            Value::Array(items) => items,
            other => {
                return Err(ClientError::Decode(format!(
                    "expected a JSON array from /sync/history, got {}",
                    excerpt(&other.to_string())
                )))
            }
        };

        let next_page = next_page(page, page_count, items.len(), limit);
        debug!(page, ?page_count, items = items.len(), "Fetched history page");

        Ok(HistoryPage {
            items,
            page,
            next_page,
            page_count,
            item_count,
        })
    }

    /// Best-effort lookup of the account name, used for start-up logging.
    pub async fn fetch_username(&self) -> Option<String> {
        let result = async {
            let response = self.get("/users/settings", &[]).await?;
            let body: Value = response.json().await?;
            Ok::<_, ClientError>(body.pointer("/user/username").and_then(Value::as_str).map(str::to_string))
        }
        .await;

        match result {
            Ok(username) => {
                if let Some(name) = &username {
                    info!(username = %name, "Connected to Trakt");
                }
                username
            }
            Err(e) => {
                debug!(error = %e, "Failed to fetch Trakt username");
                None
            }
        }
    }
}

#[async_trait]
impl HistorySource for TraktClient {
    async fn fetch_page(&self, window: &HistoryWindow, page: u32) -> ClientResult<HistoryPage> {
        TraktClient::fetch_page(self, window, page).await
    }
}

/// Second precision with a `Z` suffix, as the history endpoint expects.
pub fn format_timestamp(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn header_number(response: &Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|v| v.max(0) as u64)
}

/// The page count header is authoritative; without it a short or empty page
/// is the last one.
fn next_page(page: u32, page_count: Option<u32>, len: usize, limit: u32) -> Option<u32> {
    if len == 0 {
        return None;
    }
    match page_count {
        Some(count) if page >= count => None,
        Some(_) => Some(page + 1),
        None if len < limit as usize => None,
        None => Some(page + 1),
    }
}
