pub mod error;
pub mod ledger;
pub mod aggregate;
pub mod sink;
pub mod engine;

pub use error::{LedgerError, LedgerResult, SinkError, SyncError};
pub use ledger::{Ledger, LedgerSummary, SCHEMA_VERSION};
pub use aggregate::{build_daily_aggregates, rebuild_days, DayCalendar};
pub use sink::{AggregateSink, InfluxSettings, InfluxSink, NoopSink, RawSink};
pub use engine::{EngineSettings, PageProgress, ProgressCallback, SyncEngine, SyncOutcome, SyncReport};
