use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use crate::MediaType;

/// Grouping label of a daily aggregate. `All` spans every media type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AggregateLabel {
    All,
    Movie,
    Episode,
}

impl AggregateLabel {
    pub const ORDER: [AggregateLabel; 3] = [AggregateLabel::All, AggregateLabel::Movie, AggregateLabel::Episode];

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateLabel::All => "all",
            AggregateLabel::Movie => "movie",
            AggregateLabel::Episode => "episode",
        }
    }

    pub fn matches(&self, media_type: MediaType) -> bool {
        match self {
            AggregateLabel::All => true,
            AggregateLabel::Movie => media_type == MediaType::Movie,
            AggregateLabel::Episode => media_type == MediaType::Episode,
        }
    }
}

impl fmt::Display for AggregateLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyAggregate {
    pub day_start: DateTime<Utc>,
    pub label: AggregateLabel,
    pub events_count: u64,
    pub unique_titles_count: u64,
    pub watch_minutes_total: f64,
    pub rewatch_events_count: u64,
    pub first_watch_events_count: u64,
}
