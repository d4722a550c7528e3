pub mod error;
pub mod retry;
pub mod traits;
pub mod trakt;

pub use error::{ClientError, ClientResult, ValidationError};
pub use retry::{RetryDecision, RetryPolicy, RetryState};
pub use traits::{HistoryPage, HistorySource};
pub use trakt::{ensure_refresh_token, parse_history_item, AuthPrompt, ClientSettings, TraktAuth, TraktClient};
