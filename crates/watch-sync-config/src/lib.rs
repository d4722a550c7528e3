pub mod config;
pub mod credentials;
pub mod paths;

pub use config::{Config, ConfigError, InfluxConfig, RuntimeConfig, SyncConfig, TraktConfig};
pub use credentials::{CredentialStore, TokenSet};
pub use paths::{PathManager, container_base_path};
