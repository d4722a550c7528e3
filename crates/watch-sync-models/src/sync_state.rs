use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three sync modes. Each owns exactly one cursor row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Backfill,
    Incremental,
    Reconcile,
}

impl SyncMode {
    pub const ALL: [SyncMode; 3] = [SyncMode::Backfill, SyncMode::Incremental, SyncMode::Reconcile];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Backfill => "backfill",
            SyncMode::Incremental => "incremental",
            SyncMode::Reconcile => "reconcile",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "backfill" => Some(SyncMode::Backfill),
            "incremental" => Some(SyncMode::Incremental),
            "reconcile" => Some(SyncMode::Reconcile),
            _ => None,
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted watermark for one sync mode.
///
/// Only written after a full pull-and-persist cycle of that mode succeeded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cursor {
    pub mode: SyncMode,
    /// Wall-clock end of the last committed window
    pub last_successful_at: DateTime<Utc>,
    /// Latest `watched_at` this mode has seen so far
    pub high_water_watched_at: Option<DateTime<Utc>>,
    pub window_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BackfillState {
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Time window requested from the history endpoint. `None` means unbounded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct HistoryWindow {
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
}

impl HistoryWindow {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn between(start_at: DateTime<Utc>, end_at: DateTime<Utc>) -> Self {
        Self {
            start_at: Some(start_at),
            end_at: Some(end_at),
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start_at.map_or(true, |start| instant >= start)
            && self.end_at.map_or(true, |end| instant <= end)
    }
}

impl fmt::Display for HistoryWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = self.start_at.map(|s| s.to_rfc3339()).unwrap_or_else(|| "-inf".to_string());
        let end = self.end_at.map(|e| e.to_rfc3339()).unwrap_or_else(|| "now".to_string());
        write!(f, "[{}, {}]", start, end)
    }
}
