use crate::error::SinkError;
use crate::sink::line_protocol::{encode_batch, Point};
use crate::sink::{AggregateSink, RawSink};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};
use watch_sync_config::InfluxConfig;
use watch_sync_models::{DailyAggregate, WatchEvent};

pub const RAW_MEASUREMENT: &str = "watch_event";
pub const AGGREGATE_MEASUREMENT: &str = "watch_daily";
pub const CHECK_MEASUREMENT: &str = "watchledger_check";
const WRITE_CHUNK: usize = 2500;
const DETAIL_LIMIT: usize = 512;

#[derive(Debug, Clone)]
pub struct InfluxSettings {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket_raw: String,
    pub bucket_agg: String,
    pub request_timeout: Duration,
}

impl InfluxSettings {
    pub fn from_config(config: &InfluxConfig, request_timeout: Duration) -> Self {
        Self {
            url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            org: config.org.clone(),
            bucket_raw: config.bucket_raw.clone(),
            bucket_agg: config.bucket_agg.clone(),
            request_timeout,
        }
    }
}

/// InfluxDB v2 HTTP client speaking line protocol.
#[derive(Debug, Clone)]
pub struct InfluxSink {
    http: Client,
    settings: InfluxSettings,
}

impl InfluxSink {
    pub fn new(settings: InfluxSettings) -> Result<Self, SinkError> {
        if settings.url.is_empty() {
            return Err(SinkError::Config("InfluxDB URL is empty".to_string()));
        }
        let http = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| SinkError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, settings })
    }

    pub fn settings(&self) -> &InfluxSettings {
        &self.settings
    }

    /// Write one check point into each bucket to confirm the token may write there.
    pub async fn check_buckets(&self) -> Result<(), SinkError> {
        let point = Point::new(CHECK_MEASUREMENT, Utc::now()).field("status", "ok");
        for bucket in [&self.settings.bucket_raw, &self.settings.bucket_agg] {
            self.write_points(bucket, std::slice::from_ref(&point)).await?;
            info!(bucket = %bucket, "Check write accepted");
        }
        Ok(())
    }

    async fn write_points(&self, bucket: &str, points: &[Point]) -> Result<(), SinkError> {
        for chunk in points.chunks(WRITE_CHUNK) {
            let response = self
                .http
                .post(format!("{}/api/v2/write", self.settings.url))
                .query(&[("org", self.settings.org.as_str()), ("bucket", bucket), ("precision", "s")])
                .header("Authorization", format!("Token {}", self.settings.token))
                .header("Content-Type", "text/plain; charset=utf-8")
                .body(encode_batch(chunk))
                .send()
                .await?;
            check_status(response).await?;
            debug!(bucket, points = chunk.len(), "Wrote points to InfluxDB");
        }
        Ok(())
    }

    async fn delete(&self, bucket: &str, measurement: &str, start: DateTime<Utc>, stop: DateTime<Utc>) -> Result<(), SinkError> {
        if stop <= start {
            return Ok(());
        }
        // The delete API treats stop as inclusive; points are stored at second
        // precision, so the last second before `stop` closes the range
        let last = stop - chrono::Duration::seconds(1);
        let body = serde_json::json!({
            "start": start.to_rfc3339_opts(SecondsFormat::Secs, true),
            "stop": last.max(start).to_rfc3339_opts(SecondsFormat::Secs, true),
            "predicate": format!("_measurement=\"{}\"", measurement),
        });
        let response = self
            .http
            .post(format!("{}/api/v2/delete", self.settings.url))
            .query(&[("org", self.settings.org.as_str()), ("bucket", bucket)])
            .header("Authorization", format!("Token {}", self.settings.token))
            .json(&body)
            .send()
            .await?;
        check_status(response).await?;
        debug!(bucket, measurement, %start, %stop, "Deleted InfluxDB range");
        Ok(())
    }
}

#[async_trait]
impl RawSink for InfluxSink {
    async fn write_events(&self, events: &[WatchEvent]) -> Result<(), SinkError> {
        if events.is_empty() {
            return Ok(());
        }
        let points: Vec<Point> = events.iter().map(event_point).collect();
        self.write_points(&self.settings.bucket_raw, &points).await?;
        info!(count = points.len(), bucket = %self.settings.bucket_raw, "Exported watch events");
        Ok(())
    }

    async fn delete_range(&self, start: DateTime<Utc>, stop: DateTime<Utc>) -> Result<(), SinkError> {
        self.delete(&self.settings.bucket_raw, RAW_MEASUREMENT, start, stop).await
    }

    async fn ping(&self) -> Result<(), SinkError> {
        let response = self.http.get(format!("{}/ping", self.settings.url)).send().await?;
        check_status(response).await
    }
}

#[async_trait]
impl AggregateSink for InfluxSink {
    async fn write_aggregates(&self, aggregates: &[DailyAggregate]) -> Result<(), SinkError> {
        if aggregates.is_empty() {
            return Ok(());
        }
        let points: Vec<Point> = aggregates.iter().map(aggregate_point).collect();
        self.write_points(&self.settings.bucket_agg, &points).await?;
        info!(count = points.len(), bucket = %self.settings.bucket_agg, "Exported daily aggregates");
        Ok(())
    }

    async fn delete_range(&self, start: DateTime<Utc>, stop: DateTime<Utc>) -> Result<(), SinkError> {
        self.delete(&self.settings.bucket_agg, AGGREGATE_MEASUREMENT, start, stop).await
    }
}

pub fn event_point(event: &WatchEvent) -> Point {
    let episode = event.episode.clone().unwrap_or_default();
    Point::new(RAW_MEASUREMENT, event.watched_at)
        .tag("media_type", event.media_type.as_str())
        .tag("source", "trakt")
        .tag("is_rewatch", if event.is_rewatch { "true" } else { "false" })
        .field("history_id", event.history_id)
        .field("trakt_id", event.item_id)
        .field("runtime_min", event.runtime_minutes)
        .field("title", event.title.as_str())
        .field("ingested_at", event.ingested_at.to_rfc3339_opts(SecondsFormat::Secs, true))
        .field_opt("show_trakt_id", episode.show_item_id)
        .field_opt("season_number", episode.season_number)
        .field_opt("episode_number", episode.episode_number)
        .field_opt("year", event.year)
        .field_opt("show_title", episode.show_title.filter(|t| !t.is_empty()))
}

pub fn aggregate_point(aggregate: &DailyAggregate) -> Point {
    Point::new(AGGREGATE_MEASUREMENT, aggregate.day_start)
        .tag("media_type", aggregate.label.as_str())
        .field("events_count", aggregate.events_count)
        .field("unique_titles_count", aggregate.unique_titles_count)
        .field("watch_minutes_total", aggregate.watch_minutes_total)
        .field("rewatch_events_count", aggregate.rewatch_events_count)
        .field("first_watch_events_count", aggregate.first_watch_events_count)
}

async fn check_status(response: reqwest::Response) -> Result<(), SinkError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(SinkError::Http {
        status: status.as_u16(),
        detail: body.trim().chars().take(DETAIL_LIMIT).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use watch_sync_models::{AggregateLabel, EpisodeInfo, MediaType};
    use wiremock::matchers::{body_json, body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(server: &MockServer) -> InfluxSettings {
        InfluxSettings {
            url: server.uri(),
            token: "tok".to_string(),
            org: "home".to_string(),
            bucket_raw: "trakt_raw".to_string(),
            bucket_agg: "trakt_agg".to_string(),
            request_timeout: Duration::from_secs(5),
        }
    }

    fn episode_event() -> WatchEvent {
        WatchEvent {
            history_id: 1002,
            item_id: 5003,
            media_type: MediaType::Episode,
            watched_at: Utc.with_ymd_and_hms(2026, 2, 21, 20, 0, 0).unwrap(),
            runtime_minutes: 42.0,
            title: "Third".to_string(),
            year: None,
            episode: Some(EpisodeInfo {
                show_item_id: Some(7001),
                show_title: Some("Severance".to_string()),
                season_number: Some(1),
                episode_number: Some(3),
            }),
            is_rewatch: true,
            ingested_at: Utc.with_ymd_and_hms(2026, 2, 22, 6, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_event_point_line() {
        assert_eq!(
            event_point(&episode_event()).to_line(),
            "watch_event,media_type=episode,source=trakt,is_rewatch=true \
             history_id=1002i,trakt_id=5003i,runtime_min=42.0,title=\"Third\",ingested_at=\"2026-02-22T06:00:00Z\",\
             show_trakt_id=7001i,season_number=1i,episode_number=3i,show_title=\"Severance\" 1771704000"
        );
    }

    /// Series key and timestamp identify a point; history_id is a field, so
    /// same-second events with equal tags land on one point.
    #[test]
    fn test_same_second_events_share_point_identity() {
        let first = episode_event();
        let second = WatchEvent {
            history_id: 1003,
            title: "Fourth".to_string(),
            ..episode_event()
        };
        let identity = |line: String| {
            let (series, rest) = line.split_once(' ').unwrap();
            let timestamp = rest.rsplit(' ').next().unwrap().to_string();
            (series.to_string(), timestamp)
        };
        let a = identity(event_point(&first).to_line());
        let b = identity(event_point(&second).to_line());
        assert_eq!(a, b);
        assert!(!a.0.contains("history_id"));
    }

    #[test]
    fn test_aggregate_point_line() {
        let aggregate = DailyAggregate {
            day_start: Utc.with_ymd_and_hms(2026, 2, 21, 0, 0, 0).unwrap(),
            label: AggregateLabel::All,
            events_count: 3,
            unique_titles_count: 2,
            watch_minutes_total: 150.5,
            rewatch_events_count: 1,
            first_watch_events_count: 2,
        };
        assert_eq!(
            aggregate_point(&aggregate).to_line(),
            "watch_daily,media_type=all events_count=3i,unique_titles_count=2i,watch_minutes_total=150.5,\
             rewatch_events_count=1i,first_watch_events_count=2i 1771632000"
        );
    }

    #[tokio::test]
    async fn test_write_events_posts_line_protocol() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/write"))
            .and(query_param("org", "home"))
            .and(query_param("bucket", "trakt_raw"))
            .and(query_param("precision", "s"))
            .and(header("Authorization", "Token tok"))
            .and(body_string(event_point(&episode_event()).to_line()))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let sink = InfluxSink::new(settings(&server)).unwrap();
        sink.write_events(&[episode_event()]).await.unwrap();
        sink.write_events(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_range_uses_measurement_predicate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/delete"))
            .and(query_param("bucket", "trakt_raw"))
            .and(body_json(serde_json::json!({
                "start": "2026-02-21T00:00:00Z",
                "stop": "2026-02-21T23:59:59Z",
                "predicate": "_measurement=\"watch_event\""
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let sink = InfluxSink::new(settings(&server)).unwrap();
        let start = Utc.with_ymd_and_hms(2026, 2, 21, 0, 0, 0).unwrap();
        RawSink::delete_range(&sink, start, start + chrono::Duration::days(1)).await.unwrap();
        // empty range is a no-op
        RawSink::delete_range(&sink, start, start).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_range_keeps_next_midnight() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/delete"))
            .and(query_param("bucket", "trakt_agg"))
            .and(body_json(serde_json::json!({
                "start": "2026-03-28T23:00:00Z",
                "stop": "2026-03-29T21:59:59Z",
                "predicate": "_measurement=\"watch_daily\""
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let sink = InfluxSink::new(settings(&server)).unwrap();
        let start = Utc.with_ymd_and_hms(2026, 3, 28, 23, 0, 0).unwrap();
        let next_midnight = Utc.with_ymd_and_hms(2026, 3, 29, 22, 0, 0).unwrap();
        AggregateSink::delete_range(&sink, start, next_midnight).await.unwrap();
    }

    #[tokio::test]
    async fn test_error_status_surfaces_detail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/write"))
            .respond_with(ResponseTemplate::new(401).set_body_string("{\"code\":\"unauthorized\"}"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let sink = InfluxSink::new(settings(&server)).unwrap();
        let err = sink.write_events(&[episode_event()]).await.unwrap_err();
        assert!(matches!(err, SinkError::Http { status: 401, ref detail } if detail.contains("unauthorized")));
        sink.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_check_writes_to_both_buckets() {
        let server = MockServer::start().await;
        for bucket in ["trakt_raw", "trakt_agg"] {
            Mock::given(method("POST"))
                .and(path("/api/v2/write"))
                .and(query_param("bucket", bucket))
                .respond_with(ResponseTemplate::new(204))
                .expect(1)
                .mount(&server)
                .await;
        }

        let sink = InfluxSink::new(settings(&server)).unwrap();
        sink.check_buckets().await.unwrap();
    }

    #[test]
    fn test_rejects_empty_url() {
        let settings = InfluxSettings {
            url: String::new(),
            token: String::new(),
            org: String::new(),
            bucket_raw: String::new(),
            bucket_agg: String::new(),
            request_timeout: Duration::from_secs(1),
        };
        assert!(matches!(InfluxSink::new(settings), Err(SinkError::Config(_))));
    }
}
