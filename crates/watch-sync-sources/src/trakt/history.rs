use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde_json::Value;
use watch_sync_models::{EpisodeInfo, MediaType, WatchEvent};

/// Convert one raw `/sync/history` item into a [`WatchEvent`].
///
/// Everything loosely typed stops here: callers either get a fully populated
/// event or a reason to dead-letter the payload.
pub fn parse_history_item(item: &Value, ingested_at: DateTime<Utc>) -> Result<WatchEvent, ValidationError> {
    let raw_type = item.get("type").and_then(Value::as_str).unwrap_or_default();
    let media_type = MediaType::parse(raw_type).ok_or_else(|| ValidationError::UnsupportedType(raw_type.to_string()))?;

    let history_id = match item.get("id") {
        None | Some(Value::Null) => return Err(ValidationError::MissingField("history id")),
        Some(value) => as_u64(value).ok_or_else(|| ValidationError::InvalidValue {
            field: "history id",
            value: value.to_string(),
        })?,
    };

    let watched_raw = item
        .get("watched_at")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(ValidationError::MissingField("watched_at"))?;
    let watched_at = DateTime::parse_from_rfc3339(watched_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ValidationError::InvalidTimestamp(watched_raw.to_string()))?;

    let primary = item
        .get(media_type.as_str())
        .filter(|v| v.is_object())
        .ok_or(ValidationError::MissingField(match media_type {
            MediaType::Movie => "movie object",
            MediaType::Episode => "episode object",
        }))?;

    let item_id = primary
        .pointer("/ids/trakt")
        .and_then(as_u64)
        .ok_or(ValidationError::MissingField("trakt id"))?;

    let episode = match media_type {
        MediaType::Movie => None,
        MediaType::Episode => {
            let show = item.get("show");
            Some(EpisodeInfo {
                show_item_id: show.and_then(|s| s.pointer("/ids/trakt")).and_then(as_u64),
                show_title: show
                    .and_then(|s| s.get("title"))
                    .and_then(Value::as_str)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string),
                season_number: primary.get("season").and_then(as_u32),
                episode_number: primary.get("number").and_then(as_u32),
            })
        }
    };

    Ok(WatchEvent {
        history_id,
        item_id,
        media_type,
        watched_at,
        runtime_minutes: primary.get("runtime").and_then(Value::as_f64).unwrap_or(0.0),
        title: primary
            .get("title")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .unwrap_or("Unknown")
            .to_string(),
        year: primary.get("year").and_then(as_u32),
        episode,
        is_rewatch: item.get("rewatched").and_then(Value::as_bool).unwrap_or(false),
        ingested_at,
    })
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_u32(value: &Value) -> Option<u32> {
    as_u64(value).and_then(|v| u32::try_from(v).ok())
}
