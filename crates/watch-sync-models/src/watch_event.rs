use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::{EpisodeInfo, MediaType};

/// One historical play, as accepted into the ledger.
///
/// `history_id` is the dedupe key. Once accepted an event is never updated,
/// only removed again by reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchEvent {
    pub history_id: u64,
    /// Trakt id of the movie or episode that was watched
    pub item_id: u64,
    pub media_type: MediaType,
    pub watched_at: DateTime<Utc>,
    pub runtime_minutes: f64,
    pub title: String,
    pub year: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode: Option<EpisodeInfo>,
    pub is_rewatch: bool,
    pub ingested_at: DateTime<Utc>,
}

impl WatchEvent {
    /// Key used to count distinct titles in daily aggregates.
    ///
    /// Episodes are keyed by show and position, so two plays of the same
    /// episode collapse into one title.
    pub fn title_key(&self) -> String {
        match self.media_type {
            MediaType::Movie => format!("movie:{}", self.item_id),
            MediaType::Episode => {
                let episode = self.episode.clone().unwrap_or_default();
                let show = match (episode.show_item_id, episode.show_title) {
                    (Some(id), _) => id.to_string(),
                    (None, Some(title)) => title,
                    (None, None) => "unknown_show".to_string(),
                };
                format!(
                    "episode:{}:s{}:e{}",
                    show,
                    episode.season_number.unwrap_or(0),
                    episode.episode_number.unwrap_or(0)
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn episode(show_item_id: Option<u64>, show_title: Option<&str>) -> WatchEvent {
        WatchEvent {
            history_id: 1,
            item_id: 5001,
            media_type: MediaType::Episode,
            watched_at: Utc.with_ymd_and_hms(2026, 2, 21, 23, 30, 0).unwrap(),
            runtime_minutes: 45.0,
            title: "Pilot".to_string(),
            year: Some(2024),
            episode: Some(EpisodeInfo {
                show_item_id,
                show_title: show_title.map(str::to_string),
                season_number: Some(1),
                episode_number: Some(2),
            }),
            is_rewatch: false,
            ingested_at: Utc::now(),
        }
    }

    #[test]
    fn test_title_key_prefers_show_id() {
        assert_eq!(episode(Some(7001), Some("Show")).title_key(), "episode:7001:s1:e2");
        assert_eq!(episode(None, Some("Show")).title_key(), "episode:Show:s1:e2");
        assert_eq!(episode(None, None).title_key(), "episode:unknown_show:s1:e2");
    }

    #[test]
    fn test_title_key_movie() {
        let mut event = episode(None, None);
        event.media_type = MediaType::Movie;
        event.item_id = 999;
        event.episode = None;
        assert_eq!(event.title_key(), "movie:999");
    }
}
