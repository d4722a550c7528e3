//! The reconciling sync engine.
//!
//! Three modes share one page loop: validate, dedupe against the ledger,
//! export to the raw sink, then commit the page. Reconcile additionally diffs
//! the ledger against what upstream still returns for a rolling window and
//! retracts whatever disappeared. A mode's cursor is only written as the last
//! step of a successful run.

use crate::aggregate::{build_daily_aggregates, rebuild_days, DayCalendar};
use crate::error::SyncError;
use crate::ledger::Ledger;
use crate::sink::{AggregateSink, NoopSink, RawSink};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use watch_sync_config::{ConfigError, SyncConfig};
use watch_sync_models::{Cursor, DeadLetterEntry, HistoryWindow, SyncMode, WatchEvent};
use watch_sync_sources::{parse_history_item, HistorySource};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;
pub type ProgressCallback = Arc<dyn Fn(&PageProgress) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineSettings {
    /// Look-back subtracted from the incremental cursor
    pub overlap: Duration,
    /// Width of the rolling reconcile window
    pub reconcile_window: Duration,
    /// Day boundaries for aggregates and raw day rewrites
    pub calendar: DayCalendar,
}

impl EngineSettings {
    pub fn from_config(config: &SyncConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            overlap: Duration::hours(i64::from(config.overlap_hours)),
            reconcile_window: Duration::days(i64::from(config.reconcile_days)),
            calendar: DayCalendar::new(config.tz()?),
        })
    }
}

/// Default windows on a UTC calendar.
impl Default for EngineSettings {
    fn default() -> Self {
        let config = SyncConfig::default();
        Self {
            overlap: Duration::hours(i64::from(config.overlap_hours)),
            reconcile_window: Duration::days(i64::from(config.reconcile_days)),
            calendar: DayCalendar::utc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum SyncOutcome {
    Completed,
    Skipped(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub mode: SyncMode,
    pub outcome: SyncOutcome,
    pub dry_run: bool,
    pub window: HistoryWindow,
    pub pages: u32,
    pub events_fetched: usize,
    pub events_accepted: usize,
    pub duplicates_skipped: usize,
    pub dead_letters: usize,
    pub events_deleted: usize,
    pub days_rebuilt: usize,
    pub duration_ms: u64,
}

impl SyncReport {
    fn new(mode: SyncMode, window: HistoryWindow, dry_run: bool) -> Self {
        Self {
            mode,
            outcome: SyncOutcome::Completed,
            dry_run,
            window,
            pages: 0,
            events_fetched: 0,
            events_accepted: 0,
            duplicates_skipped: 0,
            dead_letters: 0,
            events_deleted: 0,
            days_rebuilt: 0,
            duration_ms: 0,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, SyncOutcome::Skipped(_))
    }
}

/// Emitted after every page has been committed.
#[derive(Debug, Clone, PartialEq)]
pub struct PageProgress {
    pub mode: SyncMode,
    pub page: u32,
    pub page_count: Option<u32>,
    pub item_count: Option<u64>,
    pub events_fetched: usize,
}

/// What one pass over the paginated history observed.
#[derive(Debug, Default)]
struct PullOutcome {
    affected_days: BTreeSet<NaiveDate>,
    /// Every id upstream returned, valid or dead-lettered
    remote_ids: BTreeSet<u64>,
    /// Dead letters whose payload had no usable history id
    anonymous_dead_letters: usize,
    high_water: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct ModeLocks {
    backfill: Mutex<()>,
    incremental: Mutex<()>,
    reconcile: Mutex<()>,
}

impl ModeLocks {
    fn get(&self, mode: SyncMode) -> &Mutex<()> {
        match mode {
            SyncMode::Backfill => &self.backfill,
            SyncMode::Incremental => &self.incremental,
            SyncMode::Reconcile => &self.reconcile,
        }
    }
}

pub struct SyncEngine {
    source: Arc<dyn HistorySource>,
    ledger: Arc<Ledger>,
    raw_sink: Arc<dyn RawSink>,
    aggregate_sink: Arc<dyn AggregateSink>,
    settings: EngineSettings,
    dry_run: bool,
    shutdown: Option<watch::Receiver<bool>>,
    progress: Option<ProgressCallback>,
    clock: Clock,
    locks: ModeLocks,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn HistorySource>,
        ledger: Arc<Ledger>,
        raw_sink: Arc<dyn RawSink>,
        aggregate_sink: Arc<dyn AggregateSink>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            source,
            ledger,
            raw_sink,
            aggregate_sink,
            settings,
            dry_run: false,
            shutdown: None,
            progress: None,
            clock: Arc::new(Utc::now),
            locks: ModeLocks::default(),
        }
    }

    /// Swap both sinks for no-ops. The ledger is still updated.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        if dry_run {
            self.raw_sink = Arc::new(NoopSink);
            self.aggregate_sink = Arc::new(NoopSink);
        }
        self.dry_run = dry_run;
        self
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub async fn run_backfill(&self, force: bool) -> Result<SyncReport, SyncError> {
        self.run(SyncMode::Backfill, force).await
    }

    pub async fn run_incremental(&self) -> Result<SyncReport, SyncError> {
        self.run(SyncMode::Incremental, false).await
    }

    pub async fn run_reconcile(&self) -> Result<SyncReport, SyncError> {
        self.run(SyncMode::Reconcile, false).await
    }

    /// Run one mode to completion. `force` only affects backfill.
    ///
    /// An overlapping run of the same mode is skipped rather than queued.
    pub async fn run(&self, mode: SyncMode, force: bool) -> Result<SyncReport, SyncError> {
        let now = (self.clock)();
        let Ok(_guard) = self.locks.get(mode).try_lock() else {
            warn!(operation = "sync", mode = %mode, "Previous run still in progress, skipping");
            let mut report = SyncReport::new(mode, HistoryWindow::unbounded(), self.dry_run);
            report.outcome = SyncOutcome::Skipped(format!("a {} run is already in progress", mode));
            return Ok(report);
        };

        let started = Instant::now();
        let window = match self.window_for(mode, now) {
            Ok(window) => window,
            Err(e) => return Err(self.log_failure(mode, None, e)),
        };
        let mut report = SyncReport::new(mode, window, self.dry_run);
        info!(operation = "sync", mode = %mode, window = %window, dry_run = self.dry_run, "Sync started");

        let result = match mode {
            SyncMode::Backfill => self.backfill(force, now, &mut report).await,
            SyncMode::Incremental => self.incremental(now, &mut report).await,
            SyncMode::Reconcile => self.reconcile(now, &mut report).await,
        };
        report.duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                info!(
                    operation = "sync",
                    mode = %mode,
                    outcome = ?report.outcome,
                    pages = report.pages,
                    fetched = report.events_fetched,
                    accepted = report.events_accepted,
                    duplicates = report.duplicates_skipped,
                    dead_letters = report.dead_letters,
                    deleted = report.events_deleted,
                    days_rebuilt = report.days_rebuilt,
                    duration_ms = report.duration_ms,
                    "Sync finished"
                );
                Ok(report)
            }
            Err(e) => Err(self.log_failure(mode, Some(&window), e)),
        }
    }

    fn log_failure(&self, mode: SyncMode, window: Option<&HistoryWindow>, err: SyncError) -> SyncError {
        let last_committed = self.ledger.get_cursor(mode).ok().flatten().map(|c| c.last_successful_at);
        error!(
            operation = "sync",
            mode = %mode,
            window = ?window.map(ToString::to_string),
            last_committed = ?last_committed,
            error = %err,
            "Sync failed, cursor left untouched"
        );
        err
    }

    fn window_for(&self, mode: SyncMode, now: DateTime<Utc>) -> Result<HistoryWindow, SyncError> {
        Ok(match mode {
            SyncMode::Backfill => HistoryWindow::unbounded(),
            SyncMode::Incremental => {
                let anchor = match self.ledger.get_cursor(SyncMode::Incremental)? {
                    Some(cursor) => Some(cursor.last_successful_at),
                    None => self.ledger.get_cursor(SyncMode::Backfill)?.map(|c| c.last_successful_at),
                };
                HistoryWindow {
                    start_at: anchor.map(|at| at - self.settings.overlap),
                    end_at: Some(now),
                }
            }
            SyncMode::Reconcile => HistoryWindow::between(now - self.settings.reconcile_window, now),
        })
    }

    async fn backfill(&self, force: bool, now: DateTime<Utc>, report: &mut SyncReport) -> Result<(), SyncError> {
        let state = self.ledger.get_backfill_state()?;
        if state.completed && !force {
            info!(operation = "backfill", completed_at = ?state.completed_at, "Backfill already completed");
            report.outcome = SyncOutcome::Skipped("backfill already completed".to_string());
            return Ok(());
        }

        let window = report.window;
        let pulled = self.pull(SyncMode::Backfill, &window, report).await?;
        self.rebuild(&pulled.affected_days, report).await?;

        let cursor = self.next_cursor(SyncMode::Backfill, now, &window, pulled.high_water)?;
        self.ledger.complete_backfill(&cursor)?;
        Ok(())
    }

    async fn incremental(&self, now: DateTime<Utc>, report: &mut SyncReport) -> Result<(), SyncError> {
        let window = report.window;
        let pulled = self.pull(SyncMode::Incremental, &window, report).await?;
        self.rebuild(&pulled.affected_days, report).await?;

        let cursor = self.next_cursor(SyncMode::Incremental, now, &window, pulled.high_water)?;
        self.ledger.set_cursor(&cursor)?;
        Ok(())
    }

    async fn reconcile(&self, now: DateTime<Utc>, report: &mut SyncReport) -> Result<(), SyncError> {
        let window = report.window;
        // Taken before paging: rows another mode accepts meanwhile are not
        // candidates for deletion
        let local_ids = self.ledger.ids_in_window(&window)?;
        let pulled = self.pull(SyncMode::Reconcile, &window, report).await?;
        let mut cleared_days = BTreeSet::new();

        if pulled.anonymous_dead_letters > 0 {
            warn!(
                operation = "reconcile",
                dead_letters = pulled.anonymous_dead_letters,
                "Skipping hard-delete detection: some upstream items had no readable history id"
            );
        } else {
            let missing: Vec<u64> = local_ids.difference(&pulled.remote_ids).copied().collect();
            let doomed = self.ledger.events_by_ids(&missing)?;
            if !doomed.is_empty() {
                let gone: BTreeSet<u64> = doomed.iter().map(|e| e.history_id).collect();
                cleared_days = self.settings.calendar.affected_days(&doomed);
                // Sinks first: until the ledger delete commits, the next run
                // detects the same deletes and retracts again
                self.retract_days(&cleared_days, &gone).await?;
                let removed = self.ledger.delete_events(&missing)?;
                report.events_deleted = removed.len();
                info!(
                    operation = "reconcile",
                    window = %window,
                    deleted = removed.len(),
                    days = cleared_days.len(),
                    "Applied upstream hard deletes"
                );
            }
        }

        let remaining: BTreeSet<NaiveDate> = pulled.affected_days.difference(&cleared_days).copied().collect();
        self.rebuild(&remaining, report).await?;
        report.days_rebuilt += cleared_days.len();

        let cursor = self.next_cursor(SyncMode::Reconcile, now, &window, pulled.high_water)?;
        self.ledger.set_cursor(&cursor)?;
        Ok(())
    }

    /// Walk every page of `window`, committing each page before fetching the next.
    async fn pull(&self, mode: SyncMode, window: &HistoryWindow, report: &mut SyncReport) -> Result<PullOutcome, SyncError> {
        let mut outcome = PullOutcome::default();
        let mut page = 1;

        loop {
            self.check_shutdown()?;
            let fetched = self.source.fetch_page(window, page).await?;
            report.pages += 1;
            report.events_fetched += fetched.items.len();

            let ingested_at = (self.clock)();
            let mut candidates = Vec::with_capacity(fetched.items.len());
            let mut dead_letters = Vec::new();
            for item in &fetched.items {
                match parse_history_item(item, ingested_at) {
                    Ok(event) => candidates.push(event),
                    Err(reason) => {
                        warn!(operation = "validate", mode = %mode, page, reason = %reason, "Dead-lettering history item");
                        let entry = DeadLetterEntry::new(item.clone(), reason.to_string(), mode, *window);
                        match entry.history_id {
                            Some(id) => {
                                outcome.remote_ids.insert(id);
                            }
                            None => outcome.anonymous_dead_letters += 1,
                        }
                        dead_letters.push(entry);
                    }
                }
            }

            let ids: Vec<u64> = candidates.iter().map(|e| e.history_id).collect();
            let known = self.ledger.known_ids(&ids)?;
            let mut seen = BTreeSet::new();
            let mut accepted: Vec<WatchEvent> = Vec::new();
            for event in candidates {
                outcome.remote_ids.insert(event.history_id);
                outcome.high_water = outcome.high_water.max(Some(event.watched_at));
                if known.contains(&event.history_id) || !seen.insert(event.history_id) {
                    report.duplicates_skipped += 1;
                    continue;
                }
                accepted.push(event);
            }

            if !accepted.is_empty() {
                self.raw_sink.write_events(&accepted).await?;
            }
            let inserted = self.ledger.commit_page(&accepted, &dead_letters)?;
            report.events_accepted += inserted;
            report.dead_letters += dead_letters.len();
            outcome.affected_days.extend(self.settings.calendar.affected_days(&accepted));
            debug!(
                operation = "pull",
                mode = %mode,
                page,
                items = fetched.items.len(),
                accepted = inserted,
                dead_letters = dead_letters.len(),
                "Committed page"
            );

            if let Some(progress) = &self.progress {
                progress(&PageProgress {
                    mode,
                    page,
                    page_count: fetched.page_count,
                    item_count: fetched.item_count,
                    events_fetched: report.events_fetched,
                });
            }

            match fetched.next_page {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }

        Ok(outcome)
    }

    /// Rewrite both sinks for each day from the ledger rows minus `gone`.
    async fn retract_days(&self, days: &BTreeSet<NaiveDate>, gone: &BTreeSet<u64>) -> Result<(), SyncError> {
        for day in days {
            let (start, end) = self.settings.calendar.day_bounds(*day);
            let survivors: Vec<WatchEvent> = self
                .ledger
                .events_in_range(start, end)?
                .into_iter()
                .filter(|e| !gone.contains(&e.history_id))
                .collect();

            self.raw_sink.delete_range(start, end).await?;
            if !survivors.is_empty() {
                self.raw_sink.write_events(&survivors).await?;
            }
            // Wiped first so labels that lost all their events do not linger
            self.aggregate_sink.delete_range(start, end).await?;
            let aggregates = build_daily_aggregates(&survivors, start);
            if !aggregates.is_empty() {
                self.aggregate_sink.write_aggregates(&aggregates).await?;
            }
            debug!(operation = "retract", day = %day, survivors = survivors.len(), "Rewrote day");
        }
        Ok(())
    }

    /// Recompute aggregates for `days` from the ledger.
    async fn rebuild(&self, days: &BTreeSet<NaiveDate>, report: &mut SyncReport) -> Result<(), SyncError> {
        if days.is_empty() {
            return Ok(());
        }
        let aggregates = rebuild_days(&self.ledger, &self.settings.calendar, days)?;
        self.aggregate_sink.write_aggregates(&aggregates).await?;
        report.days_rebuilt += days.len();
        Ok(())
    }

    fn next_cursor(
        &self,
        mode: SyncMode,
        now: DateTime<Utc>,
        window: &HistoryWindow,
        seen: Option<DateTime<Utc>>,
    ) -> Result<Cursor, SyncError> {
        let previous = self.ledger.get_cursor(mode)?.and_then(|c| c.high_water_watched_at);
        Ok(Cursor {
            mode,
            last_successful_at: window.end_at.unwrap_or(now),
            high_water_watched_at: seen.max(previous),
            window_start: window.start_at,
        })
    }

    fn check_shutdown(&self) -> Result<(), SyncError> {
        match &self.shutdown {
            Some(rx) if *rx.borrow() => Err(SyncError::Cancelled),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use crate::ledger::tests::event;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use watch_sync_models::{AggregateLabel, DailyAggregate};
    use watch_sync_sources::{ClientError, ClientResult, HistoryPage};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, day, hour, 0, 0).unwrap()
    }

    fn movie(id: u64, watched_at: DateTime<Utc>) -> Value {
        json!({
            "id": id,
            "watched_at": watched_at.to_rfc3339(),
            "action": "watch",
            "type": "movie",
            "movie": {
                "title": format!("Film {}", id),
                "year": 2020,
                "runtime": 100,
                "ids": { "trakt": id + 10_000 }
            }
        })
    }

    #[derive(Default)]
    struct FakeSource {
        pages: std::sync::Mutex<Vec<Vec<Value>>>,
        fail_on_page: std::sync::Mutex<Option<u32>>,
        windows: std::sync::Mutex<Vec<HistoryWindow>>,
        calls: AtomicUsize,
    }

    impl FakeSource {
        fn with_pages(pages: Vec<Vec<Value>>) -> Arc<Self> {
            let source = Self::default();
            *source.pages.lock().unwrap() = pages;
            Arc::new(source)
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HistorySource for FakeSource {
        async fn fetch_page(&self, window: &HistoryWindow, page: u32) -> ClientResult<HistoryPage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.windows.lock().unwrap().push(*window);
            if *self.fail_on_page.lock().unwrap() == Some(page) {
                return Err(ClientError::Server { status: 503, request_id: None });
            }
            let pages = self.pages.lock().unwrap();
            let count = pages.len() as u32;
            Ok(HistoryPage {
                items: pages.get(page as usize - 1).cloned().unwrap_or_default(),
                page,
                next_page: (page < count).then_some(page + 1),
                page_count: Some(count),
                item_count: None,
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: std::sync::Mutex<Vec<WatchEvent>>,
        raw_deletes: std::sync::Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
        aggregates: std::sync::Mutex<Vec<DailyAggregate>>,
        aggregate_deletes: std::sync::Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
        fail_writes: AtomicBool,
        /// Number of upcoming raw deletes to reject
        fail_deletes: AtomicUsize,
    }

    impl RecordingSink {
        fn event_ids(&self) -> Vec<u64> {
            self.events.lock().unwrap().iter().map(|e| e.history_id).collect()
        }
    }

    #[async_trait]
    impl RawSink for RecordingSink {
        async fn write_events(&self, events: &[WatchEvent]) -> Result<(), SinkError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(SinkError::Network("connection refused".to_string()));
            }
            self.events.lock().unwrap().extend_from_slice(events);
            Ok(())
        }

        async fn delete_range(&self, start: DateTime<Utc>, stop: DateTime<Utc>) -> Result<(), SinkError> {
            let failing = self
                .fail_deletes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(SinkError::Network("influx down".to_string()));
            }
            self.raw_deletes.lock().unwrap().push((start, stop));
            Ok(())
        }
    }

    #[async_trait]
    impl AggregateSink for RecordingSink {
        async fn write_aggregates(&self, aggregates: &[DailyAggregate]) -> Result<(), SinkError> {
            self.aggregates.lock().unwrap().extend_from_slice(aggregates);
            Ok(())
        }

        async fn delete_range(&self, start: DateTime<Utc>, stop: DateTime<Utc>) -> Result<(), SinkError> {
            self.aggregate_deletes.lock().unwrap().push((start, stop));
            Ok(())
        }
    }

    fn engine(source: Arc<FakeSource>, ledger: Arc<Ledger>, sink: Arc<RecordingSink>) -> SyncEngine {
        SyncEngine::new(source, ledger, sink.clone(), sink, EngineSettings::default()).with_clock(now)
    }

    #[tokio::test]
    async fn test_replaying_a_page_is_idempotent() {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let sink = Arc::new(RecordingSink::default());
        let page = vec![movie(1, at(20, 10)), movie(2, at(20, 12))];
        let source = FakeSource::with_pages(vec![page.clone(), page]);
        let engine = engine(source, ledger.clone(), sink.clone());

        let report = engine.run_backfill(false).await.unwrap();
        assert_eq!(report.events_fetched, 4);
        assert_eq!(report.events_accepted, 2);
        assert_eq!(report.duplicates_skipped, 2);
        assert_eq!(ledger.event_count().unwrap(), 2);
        assert_eq!(sink.event_ids(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_duplicates_inside_one_page_are_skipped() {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let sink = Arc::new(RecordingSink::default());
        let source = FakeSource::with_pages(vec![vec![movie(7, at(20, 10)), movie(7, at(20, 10))]]);
        let report = engine(source, ledger.clone(), sink.clone()).run_incremental().await.unwrap();

        assert_eq!(report.events_accepted, 1);
        assert_eq!(report.duplicates_skipped, 1);
        assert_eq!(sink.event_ids(), vec![7]);
    }

    #[tokio::test]
    async fn test_reconcile_deletes_ids_missing_upstream() {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        for id in 1..=5 {
            ledger.mark_accepted(&event(id, at(27, id as u32))).unwrap();
        }
        let sink = Arc::new(RecordingSink::default());
        let source = FakeSource::with_pages(vec![vec![
            movie(6, at(28, 9)),
            movie(4, at(27, 4)),
            movie(2, at(27, 2)),
            movie(1, at(27, 1)),
        ]]);
        let report = engine(source, ledger.clone(), sink.clone()).run_reconcile().await.unwrap();

        assert_eq!(report.outcome, SyncOutcome::Completed);
        assert_eq!(report.events_accepted, 1);
        assert_eq!(report.events_deleted, 2);
        assert_eq!(report.days_rebuilt, 2);
        let remaining = ledger.ids_in_window(&HistoryWindow::unbounded()).unwrap();
        assert_eq!(remaining, BTreeSet::from([1, 2, 4, 6]));

        // the affected day is wiped and rewritten from the survivors
        let day = DayCalendar::utc().day_bounds(NaiveDate::from_ymd_opt(2026, 2, 27).unwrap());
        assert_eq!(*sink.raw_deletes.lock().unwrap(), vec![day]);
        assert_eq!(*sink.aggregate_deletes.lock().unwrap(), vec![day]);
        assert_eq!(sink.event_ids(), vec![6, 1, 2, 4]);

        let aggregates = sink.aggregates.lock().unwrap();
        let all: Vec<u64> = aggregates
            .iter()
            .filter(|a| a.label == AggregateLabel::All)
            .map(|a| a.events_count)
            .collect();
        assert_eq!(all, vec![3, 1]);

        let cursor = ledger.get_cursor(SyncMode::Reconcile).unwrap().unwrap();
        assert_eq!(cursor.last_successful_at, now());
        assert_eq!(cursor.window_start, Some(now() - Duration::days(7)));
        assert_eq!(cursor.high_water_watched_at, Some(at(28, 9)));
    }

    #[tokio::test]
    async fn test_failed_retraction_is_retried_next_run() {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        ledger.mark_accepted(&event(1, at(27, 1))).unwrap();
        ledger.mark_accepted(&event(2, at(27, 2))).unwrap();
        let sink = Arc::new(RecordingSink::default());
        sink.fail_deletes.store(1, Ordering::SeqCst);
        let source = FakeSource::with_pages(vec![vec![movie(1, at(27, 1))]]);
        let engine = engine(source, ledger.clone(), sink.clone());

        let err = engine.run_reconcile().await.unwrap_err();
        assert!(matches!(err, SyncError::Sink(_)));
        assert!(ledger.is_known(2).unwrap());
        assert!(ledger.get_cursor(SyncMode::Reconcile).unwrap().is_none());

        let report = engine.run_reconcile().await.unwrap();
        assert_eq!(report.events_deleted, 1);
        assert!(!ledger.is_known(2).unwrap());
        let day = DayCalendar::utc().day_bounds(NaiveDate::from_ymd_opt(2026, 2, 27).unwrap());
        assert_eq!(*sink.raw_deletes.lock().unwrap(), vec![day]);
        assert_eq!(sink.event_ids(), vec![1]);
        let last_all = sink
            .aggregates
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.label == AggregateLabel::All)
            .map(|a| a.events_count)
            .last();
        assert_eq!(last_all, Some(1));
    }

    /// Accepts `late` into the ledger while serving the page, like an
    /// incremental run committing mid-reconcile.
    struct ConcurrentAcceptSource {
        ledger: Arc<Ledger>,
        late: WatchEvent,
    }

    #[async_trait]
    impl HistorySource for ConcurrentAcceptSource {
        async fn fetch_page(&self, _window: &HistoryWindow, page: u32) -> ClientResult<HistoryPage> {
            self.ledger.mark_accepted(&self.late).unwrap();
            Ok(HistoryPage {
                items: vec![movie(1, at(27, 1))],
                page,
                next_page: None,
                page_count: Some(1),
                item_count: None,
            })
        }
    }

    #[tokio::test]
    async fn test_reconcile_keeps_events_accepted_while_paging() {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        ledger.mark_accepted(&event(1, at(27, 1))).unwrap();
        let source = Arc::new(ConcurrentAcceptSource {
            ledger: ledger.clone(),
            late: event(9, at(28, 3)),
        });
        let sink = Arc::new(RecordingSink::default());
        let engine = SyncEngine::new(source, ledger.clone(), sink.clone(), sink.clone(), EngineSettings::default())
            .with_clock(now);

        let report = engine.run_reconcile().await.unwrap();
        assert_eq!(report.events_deleted, 0);
        assert!(ledger.is_known(9).unwrap());
        assert!(sink.raw_deletes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_skips_deletes_when_an_item_has_no_id() {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        ledger.mark_accepted(&event(1, at(27, 1))).unwrap();
        ledger.mark_accepted(&event(2, at(27, 2))).unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut broken = movie(2, at(27, 2));
        broken.as_object_mut().unwrap().remove("id");
        let source = FakeSource::with_pages(vec![vec![movie(1, at(27, 1)), broken]]);

        let report = engine(source, ledger.clone(), sink.clone()).run_reconcile().await.unwrap();
        assert_eq!(report.dead_letters, 1);
        assert_eq!(report.events_deleted, 0);
        assert_eq!(ledger.event_count().unwrap(), 2);
        assert!(sink.raw_deletes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_treats_dead_letters_with_id_as_present() {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        ledger.mark_accepted(&event(1, at(27, 1))).unwrap();
        ledger.mark_accepted(&event(2, at(27, 2))).unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut broken = movie(2, at(27, 2));
        broken["type"] = json!("show");
        let source = FakeSource::with_pages(vec![vec![movie(1, at(27, 1)), broken]]);

        let report = engine(source, ledger.clone(), sink).run_reconcile().await.unwrap();
        assert_eq!(report.dead_letters, 1);
        assert_eq!(report.events_deleted, 0);
        assert!(ledger.is_known(2).unwrap());
    }

    #[tokio::test]
    async fn test_failure_before_commit_leaves_cursor_untouched() {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let sink = Arc::new(RecordingSink::default());
        let source = FakeSource::with_pages(vec![vec![movie(1, at(27, 1))], vec![movie(2, at(26, 1))]]);
        *source.fail_on_page.lock().unwrap() = Some(2);
        let engine = engine(source.clone(), ledger.clone(), sink.clone());

        let err = engine.run_incremental().await.unwrap_err();
        assert!(matches!(err, SyncError::Source(ClientError::Server { status: 503, .. })));
        assert!(ledger.get_cursor(SyncMode::Incremental).unwrap().is_none());

        *source.fail_on_page.lock().unwrap() = None;
        let report = engine.run_incremental().await.unwrap();
        assert_eq!(report.events_accepted, 1);
        assert_eq!(report.duplicates_skipped, 1);
        assert_eq!(ledger.event_count().unwrap(), 2);
        assert_eq!(sink.event_ids(), vec![1, 2]);
        assert!(ledger.get_cursor(SyncMode::Incremental).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sink_failure_keeps_page_uncommitted() {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let sink = Arc::new(RecordingSink::default());
        sink.fail_writes.store(true, Ordering::SeqCst);
        let source = FakeSource::with_pages(vec![vec![movie(1, at(27, 1))]]);
        let engine = engine(source, ledger.clone(), sink.clone());

        let err = engine.run_backfill(false).await.unwrap_err();
        assert!(matches!(err, SyncError::Sink(_)));
        assert_eq!(ledger.event_count().unwrap(), 0);
        assert!(!ledger.get_backfill_state().unwrap().completed);

        sink.fail_writes.store(false, Ordering::SeqCst);
        engine.run_backfill(false).await.unwrap();
        assert_eq!(ledger.event_count().unwrap(), 1);
        assert!(ledger.get_backfill_state().unwrap().completed);
    }

    #[tokio::test]
    async fn test_backfill_guard_and_forced_rerun() {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let sink = Arc::new(RecordingSink::default());
        let source = FakeSource::with_pages(vec![vec![movie(1, at(20, 1)), movie(2, at(19, 1))]]);
        let engine = engine(source.clone(), ledger.clone(), sink);

        engine.run_backfill(false).await.unwrap();
        assert_eq!(source.calls(), 1);
        let cursor = ledger.get_cursor(SyncMode::Backfill).unwrap().unwrap();
        assert_eq!(cursor.last_successful_at, now());
        assert_eq!(cursor.high_water_watched_at, Some(at(20, 1)));

        let skipped = engine.run_backfill(false).await.unwrap();
        assert!(skipped.is_skipped());
        assert_eq!(source.calls(), 1);

        let forced = engine.run_backfill(true).await.unwrap();
        assert_eq!(forced.outcome, SyncOutcome::Completed);
        assert_eq!(source.calls(), 2);
        assert_eq!(ledger.event_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_malformed_item_does_not_fail_the_run() {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let sink = Arc::new(RecordingSink::default());
        let mut items: Vec<Value> = (1..=50).map(|id| movie(id, at(20, 1))).collect();
        items.insert(17, json!({ "id": 999, "type": "movie", "watched_at": "not a date" }));
        let source = FakeSource::with_pages(vec![items]);

        let report = engine(source, ledger.clone(), sink).run_backfill(false).await.unwrap();
        assert_eq!(report.events_accepted, 50);
        assert_eq!(report.dead_letters, 1);
        let dead = ledger.dead_letters(false, 10).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].history_id, Some(999));
        assert_eq!(dead[0].mode, SyncMode::Backfill);
    }

    #[tokio::test]
    async fn test_incremental_window_and_cursor() {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let sink = Arc::new(RecordingSink::default());
        let backfilled_at = at(25, 0);
        ledger
            .complete_backfill(&Cursor {
                mode: SyncMode::Backfill,
                last_successful_at: backfilled_at,
                high_water_watched_at: None,
                window_start: None,
            })
            .unwrap();
        let source = FakeSource::with_pages(vec![vec![movie(1, at(26, 8))]]);
        let engine = engine(source.clone(), ledger.clone(), sink);

        let report = engine.run_incremental().await.unwrap();
        assert_eq!(report.window, HistoryWindow::between(backfilled_at - Duration::hours(24), now()));
        let first = ledger.get_cursor(SyncMode::Incremental).unwrap().unwrap();
        assert_eq!(first.last_successful_at, now());
        assert_eq!(first.high_water_watched_at, Some(at(26, 8)));

        // a run with no events keeps the high-water mark
        source.pages.lock().unwrap().clear();
        engine.run_incremental().await.unwrap();
        let windows = source.windows.lock().unwrap();
        assert_eq!(windows.last().unwrap().start_at, Some(now() - Duration::hours(24)));
        let second = ledger.get_cursor(SyncMode::Incremental).unwrap().unwrap();
        assert_eq!(second.high_water_watched_at, Some(at(26, 8)));
    }

    #[tokio::test]
    async fn test_overlapping_run_of_same_mode_is_skipped() {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let source = FakeSource::with_pages(vec![vec![movie(1, at(26, 8))]]);
        let engine = engine(source.clone(), ledger, Arc::new(RecordingSink::default()));

        let _held = engine.locks.get(SyncMode::Incremental).try_lock().unwrap();
        let report = engine.run_incremental().await.unwrap();
        assert!(report.is_skipped());
        assert_eq!(source.calls(), 0);

        // other modes are not blocked
        engine.run_reconcile().await.unwrap();
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_between_pages() {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let source = FakeSource::with_pages(vec![vec![movie(1, at(26, 8))]]);
        let (tx, rx) = watch::channel(false);
        let engine = engine(source.clone(), ledger.clone(), Arc::new(RecordingSink::default())).with_shutdown(rx);

        tx.send(true).unwrap();
        let err = engine.run_incremental().await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(source.calls(), 0);
        assert!(ledger.get_cursor(SyncMode::Incremental).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dry_run_updates_ledger_only() {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let sink = Arc::new(RecordingSink::default());
        let source = FakeSource::with_pages(vec![vec![movie(1, at(26, 8))]]);
        let engine = engine(source, ledger.clone(), sink.clone()).with_dry_run(true);

        let report = engine.run_backfill(false).await.unwrap();
        assert!(report.dry_run);
        assert_eq!(ledger.event_count().unwrap(), 1);
        assert!(sink.events.lock().unwrap().is_empty());
        assert!(sink.aggregates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_progress_reports_every_page() {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let source = FakeSource::with_pages(vec![
            vec![movie(3, at(26, 3))],
            vec![movie(2, at(26, 2))],
            vec![movie(1, at(26, 1))],
        ]);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let engine = engine(source, ledger, Arc::new(RecordingSink::default())).with_progress(Arc::new(
            move |progress: &PageProgress| recorder.lock().unwrap().push((progress.page, progress.page_count)),
        ));

        let report = engine.run_backfill(false).await.unwrap();
        assert_eq!(report.pages, 3);
        assert_eq!(*seen.lock().unwrap(), vec![(1, Some(3)), (2, Some(3)), (3, Some(3))]);
    }
}
