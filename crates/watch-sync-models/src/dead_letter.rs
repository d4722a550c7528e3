use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::{HistoryWindow, SyncMode};

/// A history item that failed validation, kept for manual inspection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterEntry {
    /// Assigned by the ledger; `None` until recorded
    pub id: Option<i64>,
    pub history_id: Option<u64>,
    pub payload: serde_json::Value,
    pub reason: String,
    pub first_seen_at: DateTime<Utc>,
    pub mode: SyncMode,
    pub window: HistoryWindow,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DeadLetterEntry {
    pub fn new(payload: serde_json::Value, reason: String, mode: SyncMode, window: HistoryWindow) -> Self {
        let history_id = payload.get("id").and_then(|v| v.as_u64());
        Self {
            id: None,
            history_id,
            payload,
            reason,
            first_seen_at: Utc::now(),
            mode,
            window,
            resolved_at: None,
        }
    }
}
