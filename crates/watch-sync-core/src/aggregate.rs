use crate::error::LedgerResult;
use crate::ledger::Ledger;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::{BTreeSet, HashSet};
use watch_sync_models::{AggregateLabel, DailyAggregate, WatchEvent};

/// Calendar that maps instants to local days and local days back to UTC
/// instants. Aggregates are bucketed by these days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayCalendar {
    tz: Tz,
}

impl DayCalendar {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn utc() -> Self {
        Self::new(Tz::UTC)
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn day_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.tz).date_naive()
    }

    /// Local midnight of `day` as a UTC instant.
    ///
    /// Zones that skip midnight on a DST change start the day at the first
    /// valid local time after it.
    pub fn day_start(&self, day: NaiveDate) -> DateTime<Utc> {
        let midnight = day.and_time(NaiveTime::MIN);
        (0..=3)
            .find_map(|hours| {
                self.tz
                    .from_local_datetime(&(midnight + Duration::hours(hours)))
                    .earliest()
            })
            .map(|local| local.with_timezone(&Utc))
            .unwrap_or_else(|| midnight.and_utc())
    }

    /// `[day_start, next_day_start)` for `day`. Not always 24 hours long.
    pub fn day_bounds(&self, day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let next = day.succ_opt().unwrap_or(day);
        (self.day_start(day), self.day_start(next))
    }

    pub fn affected_days<'a>(&self, events: impl IntoIterator<Item = &'a WatchEvent>) -> BTreeSet<NaiveDate> {
        events.into_iter().map(|e| self.day_of(e.watched_at)).collect()
    }
}

impl Default for DayCalendar {
    fn default() -> Self {
        Self::utc()
    }
}

/// Roll up one day's events per label, stamped at `day_start`. Labels with
/// no events are omitted.
pub fn build_daily_aggregates(events: &[WatchEvent], day_start: DateTime<Utc>) -> Vec<DailyAggregate> {
    AggregateLabel::ORDER
        .iter()
        .filter_map(|label| {
            let scoped: Vec<&WatchEvent> = events.iter().filter(|e| label.matches(e.media_type)).collect();
            if scoped.is_empty() {
                return None;
            }
            let events_count = scoped.len() as u64;
            let unique_titles_count = scoped.iter().map(|e| e.title_key()).collect::<HashSet<_>>().len() as u64;
            let minutes: f64 = scoped.iter().map(|e| e.runtime_minutes).sum();
            let rewatch_events_count = scoped.iter().filter(|e| e.is_rewatch).count() as u64;

            Some(DailyAggregate {
                day_start,
                label: *label,
                events_count,
                unique_titles_count,
                watch_minutes_total: (minutes * 100.0).round() / 100.0,
                rewatch_events_count,
                first_watch_events_count: events_count - rewatch_events_count,
            })
        })
        .collect()
}

/// Recompute aggregates for exactly `days` from the ledger's current rows.
pub fn rebuild_days(
    ledger: &Ledger,
    calendar: &DayCalendar,
    days: &BTreeSet<NaiveDate>,
) -> LedgerResult<Vec<DailyAggregate>> {
    let mut aggregates = Vec::new();
    for day in days {
        let (start, end) = calendar.day_bounds(*day);
        let events = ledger.events_in_range(start, end)?;
        aggregates.extend(build_daily_aggregates(&events, start));
    }
    Ok(aggregates)
}
