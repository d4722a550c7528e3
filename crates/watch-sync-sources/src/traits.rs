use crate::error::ClientResult;
use async_trait::async_trait;
use serde_json::Value;
use watch_sync_models::HistoryWindow;

/// One page of raw history items, newest first.
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub items: Vec<Value>,
    pub page: u32,
    /// `None` once this page is the last one
    pub next_page: Option<u32>,
    pub page_count: Option<u32>,
    pub item_count: Option<u64>,
}

/// A paginated source of watch history.
///
/// The sync engine only depends on this trait so it can be driven by a fake
/// source in tests.
#[async_trait]
pub trait HistorySource: Send + Sync {
    fn source_name(&self) -> &str {
        "trakt"
    }

    async fn fetch_page(&self, window: &HistoryWindow, page: u32) -> ClientResult<HistoryPage>;
}
