use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const ACCESS_TOKEN: &str = "trakt_access_token";
const REFRESH_TOKEN: &str = "trakt_refresh_token";
const TOKEN_EXPIRES: &str = "trakt_token_expires";
const USERNAME: &str = "trakt_username";

#[derive(Debug, Serialize, Deserialize, Default)]
struct StoredCredentials {
    #[serde(flatten)]
    entries: BTreeMap<String, String>,
}

/// Persisted OAuth material. The refresh token rotates on every refresh, so
/// the store is rewritten whenever the client obtains a new pair.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

/// A token pair as returned by the token endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl CredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            entries: BTreeMap::new(),
        }
    }

    /// Create a store and load it from disk if the file exists.
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut store = Self::new(path);
        store.load()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&mut self) -> Result<()> {
        if self.path.exists() {
            let content = std::fs::read_to_string(&self.path)
                .with_context(|| format!("Failed to read credentials from {}", self.path.display()))?;
            let stored: StoredCredentials = toml::from_str(&content)
                .with_context(|| format!("Failed to parse credentials in {}", self.path.display()))?;
            self.entries = stored.entries;
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let stored = StoredCredentials {
            entries: self.entries.clone(),
        };
        let content = toml::to_string_pretty(&stored)?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write credentials to {}", self.path.display()))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    fn set(&mut self, key: &str, value: String) {
        self.entries.insert(key.to_string(), value);
    }

    pub fn access_token(&self) -> Option<&str> {
        self.get(ACCESS_TOKEN)
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.get(REFRESH_TOKEN)
    }

    pub fn token_expires(&self) -> Option<DateTime<Utc>> {
        self.get(TOKEN_EXPIRES)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn username(&self) -> Option<&str> {
        self.get(USERNAME)
    }

    pub fn set_username(&mut self, username: String) {
        self.set(USERNAME, username);
    }

    pub fn set_refresh_token(&mut self, token: String) {
        self.set(REFRESH_TOKEN, token);
    }

    pub fn token_set(&self) -> Option<TokenSet> {
        Some(TokenSet {
            access_token: self.access_token()?.to_string(),
            refresh_token: self.refresh_token()?.to_string(),
            expires_at: self.token_expires()?,
        })
    }

    pub fn set_tokens(&mut self, tokens: &TokenSet) {
        self.set(ACCESS_TOKEN, tokens.access_token.clone());
        self.set(REFRESH_TOKEN, tokens.refresh_token.clone());
        self.set(TOKEN_EXPIRES, tokens.expires_at.to_rfc3339());
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
