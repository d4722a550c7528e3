pub mod influx;
pub mod line_protocol;

use crate::error::SinkError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use watch_sync_models::{DailyAggregate, WatchEvent};

pub use influx::{InfluxSettings, InfluxSink};

/// Destination for accepted watch events.
#[async_trait]
pub trait RawSink: Send + Sync {
    async fn write_events(&self, events: &[WatchEvent]) -> Result<(), SinkError>;

    /// Remove every raw point with `start <= time < stop`.
    async fn delete_range(&self, start: DateTime<Utc>, stop: DateTime<Utc>) -> Result<(), SinkError>;

    async fn ping(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Destination for derived daily aggregates.
#[async_trait]
pub trait AggregateSink: Send + Sync {
    async fn write_aggregates(&self, aggregates: &[DailyAggregate]) -> Result<(), SinkError>;

    /// Remove every aggregate point with `start <= time < stop`.
    async fn delete_range(&self, start: DateTime<Utc>, stop: DateTime<Utc>) -> Result<(), SinkError>;
}

/// Discards everything. Used for dry runs and when the time-series store is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl RawSink for NoopSink {
    async fn write_events(&self, _events: &[WatchEvent]) -> Result<(), SinkError> {
        Ok(())
    }

    async fn delete_range(&self, _start: DateTime<Utc>, _stop: DateTime<Utc>) -> Result<(), SinkError> {
        Ok(())
    }
}

#[async_trait]
impl AggregateSink for NoopSink {
    async fn write_aggregates(&self, _aggregates: &[DailyAggregate]) -> Result<(), SinkError> {
        Ok(())
    }

    async fn delete_range(&self, _start: DateTime<Utc>, _stop: DateTime<Utc>) -> Result<(), SinkError> {
        Ok(())
    }
}
