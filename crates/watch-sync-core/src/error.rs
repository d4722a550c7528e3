use thiserror::Error;
use watch_sync_sources::ClientError;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to prepare ledger location: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode ledger payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt ledger row: {0}")]
    Corrupt(String),

    #[error("ledger schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: i32, supported: i32 },
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink request failed: {0}")]
    Network(String),

    #[error("sink rejected request: status {status}, detail {detail}")]
    Http { status: u16, detail: String },

    #[error("sink misconfigured: {0}")]
    Config(String),
}

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        SinkError::Network(err.to_string())
    }
}

/// Why a sync cycle failed. The cycle's cursor is never committed on error.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source error: {0}")]
    Source(#[from] ClientError),

    #[error("ledger error: {0}")]
    Storage(#[from] LedgerError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("sync cancelled by shutdown")]
    Cancelled,
}

impl SyncError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, SyncError::Source(e) if e.is_authentication())
    }
}
