use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

/// Failures surfaced by the Trakt client once its retry policy is exhausted.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Network(String),

    #[error("server error: status {status}, request id {}", request_id.as_deref().unwrap_or("-"))]
    Server { status: u16, request_id: Option<String> },

    #[error("rate limited: retries exhausted (last Retry-After {retry_after_secs}s)")]
    RateLimited { retry_after_secs: f64 },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("request failed: status {status}, request id {}, detail {detail}", request_id.as_deref().unwrap_or("-"))]
    Http {
        status: u16,
        request_id: Option<String>,
        detail: String,
    },

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Transient failures the retry loop may try again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Network(_) | ClientError::Server { .. } | ClientError::RateLimited { .. }
        )
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, ClientError::Authentication(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::Decode(err.to_string())
        } else {
            ClientError::Network(err.to_string())
        }
    }
}

/// Why a raw history item was rejected at the ingestion boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unsupported media type: {0}")]
    UnsupportedType(String),

    #[error("missing {0} in payload")]
    MissingField(&'static str),

    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("unparseable watched_at: {0}")]
    InvalidTimestamp(String),
}
