pub mod auth;
pub mod daemon;
pub mod dead_letters;
pub mod prompts;
pub mod reset;
pub mod status;
pub mod sync;
pub mod sync_ui;
pub mod test_sink;

use crate::output::Output;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use prompts::TerminalPrompt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use watch_sync_config::{Config, CredentialStore, PathManager};
use watch_sync_core::{
    AggregateSink, EngineSettings, InfluxSettings, InfluxSink, Ledger, NoopSink, RawSink, SyncEngine,
};
use watch_sync_sources::{ensure_refresh_token, ClientSettings, TraktClient};

/// Everything a command needs, resolved once at start-up.
pub struct AppContext {
    pub paths: PathManager,
    pub config_path: PathBuf,
    pub config: Config,
    pub output: Output,
}

impl AppContext {
    pub fn load(config_override: Option<PathBuf>, output: Output) -> Result<Self> {
        let paths = PathManager::default();
        let config_path = config_override.unwrap_or_else(|| paths.config_file());
        let config = Config::load(&config_path)
            .wrap_err_with(|| format!("Failed to load configuration from {}", config_path.display()))?;

        Ok(Self {
            paths,
            config_path,
            config,
            output,
        })
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.config
            .runtime
            .state_db_path
            .clone()
            .unwrap_or_else(|| self.paths.state_db_file())
    }

    pub fn open_ledger(&self) -> Result<Arc<Ledger>> {
        let path = self.ledger_path();
        let ledger = Ledger::open(&path).wrap_err_with(|| format!("Failed to open state ledger at {}", path.display()))?;
        Ok(Arc::new(ledger))
    }

    pub fn credential_store(&self) -> Result<CredentialStore> {
        let path = self.paths.credentials_file();
        CredentialStore::open(path.clone())
            .map_err(|e| eyre!("Failed to load credentials from {}: {}", path.display(), e))
    }

    /// Build a Trakt client, bootstrapping a refresh token if none is stored yet.
    pub async fn trakt_client(&self) -> Result<TraktClient> {
        let mut store = self.credential_store()?;
        let client = TraktClient::new(ClientSettings::from_config(&self.config), None)?;
        let prompt = TerminalPrompt::new(self.output);
        ensure_refresh_token(
            client.auth(),
            &mut store,
            self.config.trakt.refresh_token.as_deref(),
            self.config.trakt.auth_code.as_deref(),
            &prompt,
        )
        .await
        .wrap_err("Trakt authorization failed; run `watchledger auth`")?;
        Ok(client.with_credentials(store))
    }

    /// The configured InfluxDB sink, or `None` when it is disabled.
    pub fn influx_sink(&self) -> Result<Option<InfluxSink>> {
        if !self.config.influx.enabled {
            return Ok(None);
        }
        let settings = InfluxSettings::from_config(
            &self.config.influx,
            Duration::from_secs(self.config.runtime.request_timeout_secs.max(1)),
        );
        Ok(Some(InfluxSink::new(settings)?))
    }

    pub fn sinks(&self, dry_run: bool) -> Result<(Arc<dyn RawSink>, Arc<dyn AggregateSink>)> {
        if !dry_run {
            if let Some(sink) = self.influx_sink()? {
                let sink = Arc::new(sink);
                let raw: Arc<dyn RawSink> = sink.clone();
                let aggregate: Arc<dyn AggregateSink> = sink;
                return Ok((raw, aggregate));
            }
            info!(reason = "config", "InfluxDB export disabled");
        }
        let raw: Arc<dyn RawSink> = Arc::new(NoopSink);
        let aggregate: Arc<dyn AggregateSink> = Arc::new(NoopSink);
        Ok((raw, aggregate))
    }

    pub async fn engine(&self, dry_run: bool) -> Result<SyncEngine> {
        self.config.validate(!dry_run)?;
        let client = self.trakt_client().await?;
        let ledger = self.open_ledger()?;
        let (raw_sink, aggregate_sink) = self.sinks(dry_run)?;
        let settings = EngineSettings::from_config(&self.config.sync)?;
        Ok(SyncEngine::new(Arc::new(client), ledger, raw_sink, aggregate_sink, settings)
        .with_dry_run(dry_run))
    }

    /// Drop stored tokens so the next run re-authorizes.
    pub fn forget_tokens(&self) -> Result<()> {
        let mut store = self.credential_store()?;
        store.clear();
        store
            .save()
            .map_err(|e| eyre!("Failed to save credentials to {}: {}", store.path().display(), e))
    }
}
