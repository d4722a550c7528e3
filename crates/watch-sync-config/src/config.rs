use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to write config file: {0}")]
    Write(String),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("missing required configuration value: {0}")]
    Missing(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub trakt: TraktConfig,
    #[serde(default)]
    pub influx: InfluxConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraktConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Seed refresh token, only used until the credential store holds one
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub auth_code: Option<String>,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub org: String,
    #[serde(default = "default_bucket_raw")]
    pub bucket_raw: String,
    #[serde(default = "default_bucket_agg")]
    pub bucket_agg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_cron")]
    pub sync_cron: String,
    #[serde(default = "default_reconcile_cron")]
    pub reconcile_cron: String,
    #[serde(default = "default_overlap_hours")]
    pub overlap_hours: u32,
    #[serde(default = "default_reconcile_days")]
    pub reconcile_days: u32,
    /// IANA zone whose calendar days the aggregates are bucketed by
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl SyncConfig {
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone.trim().parse::<Tz>().map_err(|_| ConfigError::InvalidValue {
            key: "TIMEZONE".to_string(),
            value: self.timezone.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Overrides the ledger location derived from the data directory
    #[serde(default)]
    pub state_db_path: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_after_margin_secs")]
    pub retry_after_margin_secs: f64,
    #[serde(default)]
    pub min_request_interval_secs: f64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_api_base_url() -> String {
    "https://api.trakt.tv".to_string()
}

fn default_page_size() -> u32 {
    100
}

fn default_bucket_raw() -> String {
    "trakt_raw".to_string()
}

fn default_bucket_agg() -> String {
    "trakt_agg".to_string()
}

fn default_sync_cron() -> String {
    "0 6,18 * * *".to_string()
}

fn default_reconcile_cron() -> String {
    "30 3 * * *".to_string()
}

fn default_overlap_hours() -> u32 {
    24
}

fn default_reconcile_days() -> u32 {
    7
}

fn default_timezone() -> String {
    "Europe/Berlin".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_after_margin_secs() -> f64 {
    0.9
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for TraktConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            refresh_token: None,
            auth_code: None,
            api_base_url: default_api_base_url(),
            page_size: default_page_size(),
        }
    }
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            url: String::new(),
            token: String::new(),
            org: String::new(),
            bucket_raw: default_bucket_raw(),
            bucket_agg: default_bucket_agg(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_cron: default_sync_cron(),
            reconcile_cron: default_reconcile_cron(),
            overlap_hours: default_overlap_hours(),
            reconcile_days: default_reconcile_days(),
            timezone: default_timezone(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            state_db_path: None,
            log_level: default_log_level(),
            max_retries: default_max_retries(),
            retry_after_margin_secs: default_retry_after_margin_secs(),
            min_request_interval_secs: 0.0,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the file if it exists, otherwise start from defaults, then apply
    /// environment overrides. Environment always wins over the file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write(e.to_string()))?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Write(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Write(e.to_string()))?;
        Ok(())
    }

    /// Apply overrides from a key lookup. Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("TRAKT_CLIENT_ID") {
            self.trakt.client_id = v;
        }
        if let Some(v) = get("TRAKT_CLIENT_SECRET") {
            self.trakt.client_secret = v;
        }
        if let Some(v) = get("TRAKT_REFRESH_TOKEN") {
            self.trakt.refresh_token = Some(v);
        }
        if let Some(v) = get("TRAKT_AUTH_CODE") {
            self.trakt.auth_code = Some(v);
        }
        if let Some(v) = get("TRAKT_API_BASE_URL") {
            self.trakt.api_base_url = v;
        }
        if let Some(v) = get("ENABLE_INFLUX") {
            self.influx.enabled = parse_bool(&v);
        }
        if let Some(v) = get("INFLUX_URL") {
            self.influx.url = v;
        }
        if let Some(v) = get("INFLUX_TOKEN") {
            self.influx.token = v;
        }
        if let Some(v) = get("INFLUX_ORG") {
            self.influx.org = v;
        }
        if let Some(v) = get("INFLUX_BUCKET_RAW") {
            self.influx.bucket_raw = v;
        }
        if let Some(v) = get("INFLUX_BUCKET_AGG") {
            self.influx.bucket_agg = v;
        }
        if let Some(v) = get("SYNC_CRON") {
            self.sync.sync_cron = v;
        }
        if let Some(v) = get("RECONCILE_CRON") {
            self.sync.reconcile_cron = v;
        }
        if let Some(v) = get("OVERLAP_HOURS") {
            self.sync.overlap_hours = parse_number("OVERLAP_HOURS", &v)?;
        }
        if let Some(v) = get("RECONCILE_DAYS") {
            self.sync.reconcile_days = parse_number("RECONCILE_DAYS", &v)?;
        }
        if let Some(v) = get("TIMEZONE") {
            self.sync.timezone = v;
        }
        if let Some(v) = get("STATE_DB_PATH") {
            self.runtime.state_db_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.runtime.log_level = v;
        }
        if let Some(v) = get("TRAKT_MAX_RETRIES") {
            self.runtime.max_retries = parse_number("TRAKT_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("TRAKT_RETRY_AFTER_MARGIN") {
            self.runtime.retry_after_margin_secs = parse_number("TRAKT_RETRY_AFTER_MARGIN", &v)?;
        }
        if let Some(v) = get("TRAKT_MIN_REQUEST_INTERVAL_SECONDS") {
            self.runtime.min_request_interval_secs = parse_number("TRAKT_MIN_REQUEST_INTERVAL_SECONDS", &v)?;
        }
        Ok(())
    }

    /// Check everything needed before any sync can start.
    ///
    /// Influx settings are only required when the sink is actually used.
    pub fn validate(&self, require_influx: bool) -> Result<(), ConfigError> {
        if self.trakt.client_id.trim().is_empty() {
            return Err(ConfigError::Missing("TRAKT_CLIENT_ID".to_string()));
        }
        if self.trakt.client_secret.trim().is_empty() {
            return Err(ConfigError::Missing("TRAKT_CLIENT_SECRET".to_string()));
        }
        if self.trakt.page_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "trakt.page_size".to_string(),
                value: "0".to_string(),
            });
        }
        if self.sync.reconcile_days == 0 {
            return Err(ConfigError::InvalidValue {
                key: "sync.reconcile_days".to_string(),
                value: "0".to_string(),
            });
        }
        self.sync.tz()?;
        if self.runtime.retry_after_margin_secs < 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "runtime.retry_after_margin_secs".to_string(),
                value: self.runtime.retry_after_margin_secs.to_string(),
            });
        }

        if require_influx && self.influx.enabled {
            let missing: Vec<&str> = [
                ("INFLUX_URL", &self.influx.url),
                ("INFLUX_TOKEN", &self.influx.token),
                ("INFLUX_ORG", &self.influx.org),
            ]
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
            if !missing.is_empty() {
                return Err(ConfigError::Missing(missing.join(", ")));
            }
        }

        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
