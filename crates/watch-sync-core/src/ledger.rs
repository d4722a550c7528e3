//! Durable sync state backed by SQLite.
//!
//! The ledger owns every persisted row: accepted event ids (the dedupe set),
//! per-mode cursors, the backfill flag and the dead-letter log. Each public
//! operation runs in its own transaction, so a crash leaves either the whole
//! operation or none of it on disk.
//!
//! Timestamps are stored as epoch milliseconds.

use crate::error::{LedgerError, LedgerResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use watch_sync_models::{
    BackfillState, Cursor, DeadLetterEntry, EpisodeInfo, HistoryWindow, MediaType, SyncMode, WatchEvent,
};

/// Schema version tracked through `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

const MIGRATIONS: &[&str] = &[
    // 1: initial schema
    "CREATE TABLE IF NOT EXISTS accepted_events (
        history_id INTEGER PRIMARY KEY,
        item_id INTEGER NOT NULL,
        media_type TEXT NOT NULL,
        watched_at INTEGER NOT NULL,
        runtime_minutes REAL NOT NULL,
        title TEXT NOT NULL,
        year INTEGER,
        show_item_id INTEGER,
        show_title TEXT,
        season_number INTEGER,
        episode_number INTEGER,
        is_rewatch INTEGER NOT NULL,
        ingested_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_accepted_events_watched_at ON accepted_events(watched_at);

    CREATE TABLE IF NOT EXISTS sync_cursors (
        mode TEXT PRIMARY KEY,
        last_successful_at INTEGER NOT NULL,
        high_water_watched_at INTEGER,
        window_start INTEGER
    );

    CREATE TABLE IF NOT EXISTS backfill_state (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        completed INTEGER NOT NULL,
        completed_at INTEGER
    );

    CREATE TABLE IF NOT EXISTS dead_letters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        history_id INTEGER,
        payload TEXT NOT NULL,
        reason TEXT NOT NULL,
        first_seen_at INTEGER NOT NULL,
        mode TEXT NOT NULL,
        window_start INTEGER,
        window_end INTEGER,
        resolved_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_dead_letters_unresolved ON dead_letters(resolved_at);",
];

const EVENT_COLUMNS: &str = "history_id, item_id, media_type, watched_at, runtime_minutes, title, year, \
     show_item_id, show_title, season_number, episode_number, is_rewatch, ingested_at";

/// Counts shown by `watchledger status`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LedgerSummary {
    pub accepted_events: u64,
    pub unresolved_dead_letters: u64,
    pub backfill: BackfillState,
    pub cursors: Vec<Cursor>,
    pub oldest_watched_at: Option<DateTime<Utc>>,
    pub newest_watched_at: Option<DateTime<Utc>>,
}

pub struct Ledger {
    conn: Mutex<Connection>,
}

impl Ledger {
    pub fn open(path: &Path) -> LedgerResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        debug!(path = %path.display(), "Opened state ledger");
        Self::init(conn)
    }

    pub fn open_in_memory() -> LedgerResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> LedgerResult<Self> {
        migrate(&mut conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> LedgerResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LedgerError::Corrupt("ledger connection lock poisoned".to_string()))
    }

    pub fn is_known(&self, history_id: u64) -> LedgerResult<bool> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM accepted_events WHERE history_id = ?1",
                params![history_id as i64],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Which of `history_ids` are already accepted.
    pub fn known_ids(&self, history_ids: &[u64]) -> LedgerResult<BTreeSet<u64>> {
        let conn = self.conn()?;
        let mut known = BTreeSet::new();
        let mut stmt = conn.prepare_cached("SELECT 1 FROM accepted_events WHERE history_id = ?1")?;
        for id in history_ids {
            if stmt.exists(params![*id as i64])? {
                known.insert(*id);
            }
        }
        Ok(known)
    }

    /// Insert one event; `false` when its id was already accepted.
    pub fn mark_accepted(&self, event: &WatchEvent) -> LedgerResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let inserted = insert_event(&tx, event)?;
        tx.commit()?;
        Ok(inserted)
    }

    /// Persist one page's accepted events and dead letters atomically.
    /// Returns how many events were newly inserted.
    pub fn commit_page(&self, accepted: &[WatchEvent], dead_letters: &[DeadLetterEntry]) -> LedgerResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        for event in accepted {
            if insert_event(&tx, event)? {
                inserted += 1;
            }
        }
        for entry in dead_letters {
            insert_dead_letter(&tx, entry)?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn get_cursor(&self, mode: SyncMode) -> LedgerResult<Option<Cursor>> {
        let conn = self.conn()?;
        let cursor = conn
            .query_row(
                "SELECT last_successful_at, high_water_watched_at, window_start FROM sync_cursors WHERE mode = ?1",
                params![mode.as_str()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                    ))
                },
            )
            .optional()?;

        cursor
            .map(|(last, high_water, window_start)| {
                Ok(Cursor {
                    mode,
                    last_successful_at: from_millis(last)?,
                    high_water_watched_at: high_water.map(from_millis).transpose()?,
                    window_start: window_start.map(from_millis).transpose()?,
                })
            })
            .transpose()
    }

    pub fn set_cursor(&self, cursor: &Cursor) -> LedgerResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        upsert_cursor(&tx, cursor)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_backfill_state(&self) -> LedgerResult<BackfillState> {
        let conn = self.conn()?;
        let row = conn
            .query_row("SELECT completed, completed_at FROM backfill_state WHERE id = 1", [], |row| {
                Ok((row.get::<_, bool>(0)?, row.get::<_, Option<i64>>(1)?))
            })
            .optional()?;
        match row {
            None => Ok(BackfillState::default()),
            Some((completed, completed_at)) => Ok(BackfillState {
                completed,
                completed_at: completed_at.map(from_millis).transpose()?,
            }),
        }
    }

    pub fn mark_backfill_complete(&self, at: DateTime<Utc>) -> LedgerResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        set_backfill_complete(&tx, at)?;
        tx.commit()?;
        Ok(())
    }

    /// Set the backfill flag and the backfill cursor in one transaction.
    pub fn complete_backfill(&self, cursor: &Cursor) -> LedgerResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        upsert_cursor(&tx, cursor)?;
        set_backfill_complete(&tx, cursor.last_successful_at)?;
        tx.commit()?;
        info!(completed_at = %cursor.last_successful_at, "Backfill marked complete");
        Ok(())
    }

    /// Record a dead letter. An unresolved entry with the same payload is
    /// reused instead of duplicated; its id is returned either way.
    pub fn record_dead_letter(&self, entry: &DeadLetterEntry) -> LedgerResult<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let id = insert_dead_letter(&tx, entry)?;
        tx.commit()?;
        Ok(id)
    }

    pub fn dead_letters(&self, include_resolved: bool, limit: usize) -> LedgerResult<Vec<DeadLetterEntry>> {
        let conn = self.conn()?;
        let sql = if include_resolved {
            "SELECT id, history_id, payload, reason, first_seen_at, mode, window_start, window_end, resolved_at
             FROM dead_letters ORDER BY id DESC LIMIT ?1"
        } else {
            "SELECT id, history_id, payload, reason, first_seen_at, mode, window_start, window_end, resolved_at
             FROM dead_letters WHERE resolved_at IS NULL ORDER BY id DESC LIMIT ?1"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<i64>>(6)?,
                row.get::<_, Option<i64>>(7)?,
                row.get::<_, Option<i64>>(8)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, history_id, payload, reason, first_seen_at, mode, window_start, window_end, resolved_at) = row?;
            entries.push(DeadLetterEntry {
                id: Some(id),
                history_id: history_id.map(|h| h as u64),
                payload: serde_json::from_str(&payload)?,
                reason,
                first_seen_at: from_millis(first_seen_at)?,
                mode: SyncMode::parse(&mode).ok_or_else(|| LedgerError::Corrupt(format!("unknown sync mode {}", mode)))?,
                window: HistoryWindow {
                    start_at: window_start.map(from_millis).transpose()?,
                    end_at: window_end.map(from_millis).transpose()?,
                },
                resolved_at: resolved_at.map(from_millis).transpose()?,
            });
        }
        Ok(entries)
    }

    /// Mark a dead letter resolved. `false` if it does not exist or already was.
    pub fn resolve_dead_letter(&self, id: i64) -> LedgerResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE dead_letters SET resolved_at = ?1 WHERE id = ?2 AND resolved_at IS NULL",
            params![Utc::now().timestamp_millis(), id],
        )?;
        Ok(changed > 0)
    }

    /// Remove accepted events, returning the rows that existed.
    pub fn delete_events(&self, history_ids: &[u64]) -> LedgerResult<Vec<WatchEvent>> {
        if history_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut removed = Vec::new();
        {
            let mut select = tx.prepare_cached(&format!(
                "SELECT {} FROM accepted_events WHERE history_id = ?1",
                EVENT_COLUMNS
            ))?;
            let mut delete = tx.prepare_cached("DELETE FROM accepted_events WHERE history_id = ?1")?;
            for id in history_ids {
                let row = select.query_row(params![*id as i64], row_to_event_parts).optional()?;
                if let Some(parts) = row {
                    removed.push(parts.into_event()?);
                    delete.execute(params![*id as i64])?;
                }
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    /// The accepted rows for `history_ids`; unknown ids are left out.
    pub fn events_by_ids(&self, history_ids: &[u64]) -> LedgerResult<Vec<WatchEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM accepted_events WHERE history_id = ?1",
            EVENT_COLUMNS
        ))?;
        let mut events = Vec::new();
        for id in history_ids {
            if let Some(parts) = stmt.query_row(params![*id as i64], row_to_event_parts).optional()? {
                events.push(parts.into_event()?);
            }
        }
        Ok(events)
    }

    /// Accepted events with `start <= watched_at < end`, oldest first.
    pub fn events_in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> LedgerResult<Vec<WatchEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM accepted_events WHERE watched_at >= ?1 AND watched_at < ?2
             ORDER BY watched_at ASC, history_id ASC",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![start.timestamp_millis(), end.timestamp_millis()],
            row_to_event_parts,
        )?;
        let events = rows.map(|row| row?.into_event()).collect::<LedgerResult<Vec<_>>>();
        events
    }

    /// Ids of accepted events inside the window, bounds inclusive.
    pub fn ids_in_window(&self, window: &HistoryWindow) -> LedgerResult<BTreeSet<u64>> {
        let conn = self.conn()?;
        let start = window.start_at.map(|s| s.timestamp_millis()).unwrap_or(i64::MIN);
        let end = window.end_at.map(|e| e.timestamp_millis()).unwrap_or(i64::MAX);
        let mut stmt =
            conn.prepare_cached("SELECT history_id FROM accepted_events WHERE watched_at >= ?1 AND watched_at <= ?2")?;
        let rows = stmt.query_map(params![start, end], |row| row.get::<_, i64>(0))?;
        let mut ids = BTreeSet::new();
        for id in rows {
            ids.insert(id? as u64);
        }
        Ok(ids)
    }

    pub fn event_count(&self) -> LedgerResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM accepted_events", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn summary(&self) -> LedgerResult<LedgerSummary> {
        let backfill = self.get_backfill_state()?;
        let mut cursors = Vec::new();
        for mode in SyncMode::ALL {
            if let Some(cursor) = self.get_cursor(mode)? {
                cursors.push(cursor);
            }
        }

        let conn = self.conn()?;
        let (count, oldest, newest): (i64, Option<i64>, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), MIN(watched_at), MAX(watched_at) FROM accepted_events",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let unresolved: i64 =
            conn.query_row("SELECT COUNT(*) FROM dead_letters WHERE resolved_at IS NULL", [], |row| row.get(0))?;

        Ok(LedgerSummary {
            accepted_events: count as u64,
            unresolved_dead_letters: unresolved as u64,
            backfill,
            cursors,
            oldest_watched_at: oldest.map(from_millis).transpose()?,
            newest_watched_at: newest.map(from_millis).transpose()?,
        })
    }

    /// Wipe every ledger table. Credentials live elsewhere and survive.
    pub fn reset_all(&self) -> LedgerResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM accepted_events;
             DELETE FROM sync_cursors;
             DELETE FROM backfill_state;
             DELETE FROM dead_letters;",
        )?;
        tx.commit()?;
        info!("State ledger reset");
        Ok(())
    }
}

fn migrate(conn: &mut Connection) -> LedgerResult<()> {
    let current: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current > SCHEMA_VERSION {
        return Err(LedgerError::UnsupportedSchema {
            found: current,
            supported: SCHEMA_VERSION,
        });
    }
    for (index, sql) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        let version = index as i32 + 1;
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        debug!(version, "Applied ledger migration");
    }
    Ok(())
}

fn insert_event(tx: &Transaction<'_>, event: &WatchEvent) -> LedgerResult<bool> {
    let episode = event.episode.clone().unwrap_or_default();
    let changed = tx.execute(
        &format!(
            "INSERT OR IGNORE INTO accepted_events ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            EVENT_COLUMNS
        ),
        params![
            event.history_id as i64,
            event.item_id as i64,
            event.media_type.as_str(),
            event.watched_at.timestamp_millis(),
            event.runtime_minutes,
            event.title,
            event.year,
            episode.show_item_id.map(|id| id as i64),
            episode.show_title,
            episode.season_number,
            episode.episode_number,
            event.is_rewatch,
            event.ingested_at.timestamp_millis(),
        ],
    )?;
    Ok(changed > 0)
}

fn insert_dead_letter(tx: &Transaction<'_>, entry: &DeadLetterEntry) -> LedgerResult<i64> {
    let payload = serde_json::to_string(&entry.payload)?;
    let existing = tx
        .query_row(
            "SELECT id FROM dead_letters WHERE resolved_at IS NULL AND payload = ?1 AND reason = ?2",
            params![payload, entry.reason],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }

    tx.execute(
        "INSERT INTO dead_letters (history_id, payload, reason, first_seen_at, mode, window_start, window_end, resolved_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.history_id.map(|h| h as i64),
            payload,
            entry.reason,
            entry.first_seen_at.timestamp_millis(),
            entry.mode.as_str(),
            entry.window.start_at.map(|s| s.timestamp_millis()),
            entry.window.end_at.map(|e| e.timestamp_millis()),
            entry.resolved_at.map(|r| r.timestamp_millis()),
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

fn upsert_cursor(tx: &Transaction<'_>, cursor: &Cursor) -> LedgerResult<()> {
    tx.execute(
        "INSERT INTO sync_cursors (mode, last_successful_at, high_water_watched_at, window_start)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(mode) DO UPDATE SET
            last_successful_at = excluded.last_successful_at,
            high_water_watched_at = excluded.high_water_watched_at,
            window_start = excluded.window_start",
        params![
            cursor.mode.as_str(),
            cursor.last_successful_at.timestamp_millis(),
            cursor.high_water_watched_at.map(|h| h.timestamp_millis()),
            cursor.window_start.map(|w| w.timestamp_millis()),
        ],
    )?;
    Ok(())
}

fn set_backfill_complete(tx: &Transaction<'_>, at: DateTime<Utc>) -> LedgerResult<()> {
    tx.execute(
        "INSERT INTO backfill_state (id, completed, completed_at) VALUES (1, 1, ?1)
         ON CONFLICT(id) DO UPDATE SET completed = 1, completed_at = excluded.completed_at",
        params![at.timestamp_millis()],
    )?;
    Ok(())
}

fn from_millis(millis: i64) -> LedgerResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| LedgerError::Corrupt(format!("timestamp {} out of range", millis)))
}

/// Raw column values, converted outside the rusqlite row callback so that
/// conversion errors surface as `LedgerError`.
struct EventParts {
    history_id: i64,
    item_id: i64,
    media_type: String,
    watched_at: i64,
    runtime_minutes: f64,
    title: String,
    year: Option<u32>,
    show_item_id: Option<i64>,
    show_title: Option<String>,
    season_number: Option<u32>,
    episode_number: Option<u32>,
    is_rewatch: bool,
    ingested_at: i64,
}

fn row_to_event_parts(row: &Row<'_>) -> rusqlite::Result<EventParts> {
    Ok(EventParts {
        history_id: row.get(0)?,
        item_id: row.get(1)?,
        media_type: row.get(2)?,
        watched_at: row.get(3)?,
        runtime_minutes: row.get(4)?,
        title: row.get(5)?,
        year: row.get(6)?,
        show_item_id: row.get(7)?,
        show_title: row.get(8)?,
        season_number: row.get(9)?,
        episode_number: row.get(10)?,
        is_rewatch: row.get(11)?,
        ingested_at: row.get(12)?,
    })
}

impl EventParts {
    fn into_event(self) -> LedgerResult<WatchEvent> {
        let media_type = MediaType::parse(&self.media_type)
            .ok_or_else(|| LedgerError::Corrupt(format!("unknown media type {}", self.media_type)))?;
        let episode = match media_type {
            MediaType::Movie => None,
            MediaType::Episode => Some(EpisodeInfo {
                show_item_id: self.show_item_id.map(|id| id as u64),
                show_title: self.show_title,
                season_number: self.season_number,
                episode_number: self.episode_number,
            }),
        };
        Ok(WatchEvent {
            history_id: self.history_id as u64,
            item_id: self.item_id as u64,
            media_type,
            watched_at: from_millis(self.watched_at)?,
            runtime_minutes: self.runtime_minutes,
            title: self.title,
            year: self.year,
            episode,
            is_rewatch: self.is_rewatch,
            ingested_at: from_millis(self.ingested_at)?,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    pub(crate) fn event(history_id: u64, watched_at: DateTime<Utc>) -> WatchEvent {
        WatchEvent {
            history_id,
            item_id: history_id + 10_000,
            media_type: MediaType::Movie,
            watched_at,
            runtime_minutes: 100.0,
            title: format!("Film {}", history_id),
            year: Some(2020),
            episode: None,
            is_rewatch: false,
            ingested_at: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_mark_accepted_is_idempotent() {
        let ledger = Ledger::open_in_memory().unwrap();
        let e = event(1, at(10, 12));
        assert!(!ledger.is_known(1).unwrap());
        assert!(ledger.mark_accepted(&e).unwrap());
        assert!(!ledger.mark_accepted(&e).unwrap());
        assert!(ledger.is_known(1).unwrap());
        assert_eq!(ledger.event_count().unwrap(), 1);
    }

    #[test]
    fn test_commit_page_counts_new_rows_only() {
        let ledger = Ledger::open_in_memory().unwrap();
        let page = vec![event(1, at(10, 1)), event(2, at(10, 2))];
        assert_eq!(ledger.commit_page(&page, &[]).unwrap(), 2);
        assert_eq!(ledger.commit_page(&page, &[]).unwrap(), 0);
        assert_eq!(ledger.event_count().unwrap(), 2);
        assert_eq!(ledger.known_ids(&[1, 3]).unwrap(), BTreeSet::from([1]));
    }

    #[test]
    fn test_event_round_trip_keeps_episode_fields() {
        let ledger = Ledger::open_in_memory().unwrap();
        let mut e = event(7, at(11, 9));
        e.media_type = MediaType::Episode;
        e.is_rewatch = true;
        e.episode = Some(EpisodeInfo {
            show_item_id: Some(42),
            show_title: Some("Show".to_string()),
            season_number: Some(2),
            episode_number: Some(5),
        });
        ledger.mark_accepted(&e).unwrap();

        let loaded = ledger.events_in_range(at(11, 0), at(12, 0)).unwrap();
        assert_eq!(loaded, vec![e]);
    }

    #[test]
    fn test_cursor_upsert() {
        let ledger = Ledger::open_in_memory().unwrap();
        assert!(ledger.get_cursor(SyncMode::Incremental).unwrap().is_none());

        let mut cursor = Cursor {
            mode: SyncMode::Incremental,
            last_successful_at: at(10, 0),
            high_water_watched_at: Some(at(9, 22)),
            window_start: Some(at(9, 0)),
        };
        ledger.set_cursor(&cursor).unwrap();
        cursor.last_successful_at = at(11, 0);
        cursor.high_water_watched_at = None;
        ledger.set_cursor(&cursor).unwrap();

        assert_eq!(ledger.get_cursor(SyncMode::Incremental).unwrap(), Some(cursor));
        assert!(ledger.get_cursor(SyncMode::Reconcile).unwrap().is_none());
    }

    #[test]
    fn test_complete_backfill_sets_flag_and_cursor() {
        let ledger = Ledger::open_in_memory().unwrap();
        assert!(!ledger.get_backfill_state().unwrap().completed);

        let cursor = Cursor {
            mode: SyncMode::Backfill,
            last_successful_at: at(12, 0),
            high_water_watched_at: None,
            window_start: None,
        };
        ledger.complete_backfill(&cursor).unwrap();

        let state = ledger.get_backfill_state().unwrap();
        assert!(state.completed);
        assert_eq!(state.completed_at, Some(at(12, 0)));
        assert_eq!(ledger.get_cursor(SyncMode::Backfill).unwrap(), Some(cursor));
    }

    #[test]
    fn test_dead_letters_dedupe_and_resolve() {
        let ledger = Ledger::open_in_memory().unwrap();
        let entry = DeadLetterEntry::new(
            serde_json::json!({ "id": 99, "type": "show" }),
            "unsupported media type: show".to_string(),
            SyncMode::Reconcile,
            HistoryWindow::between(at(1, 0), at(8, 0)),
        );
        let first = ledger.record_dead_letter(&entry).unwrap();
        let second = ledger.record_dead_letter(&entry).unwrap();
        assert_eq!(first, second);

        let open = ledger.dead_letters(false, 10).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].history_id, Some(99));
        assert_eq!(open[0].window, entry.window);

        assert!(ledger.resolve_dead_letter(first).unwrap());
        assert!(!ledger.resolve_dead_letter(first).unwrap());
        assert!(ledger.dead_letters(false, 10).unwrap().is_empty());
        assert_eq!(ledger.dead_letters(true, 10).unwrap().len(), 1);

        // a resolved entry does not swallow a fresh occurrence
        let third = ledger.record_dead_letter(&entry).unwrap();
        assert_ne!(third, first);
    }

    #[test]
    fn test_delete_events_returns_removed_rows() {
        let ledger = Ledger::open_in_memory().unwrap();
        for id in 1..=3 {
            ledger.mark_accepted(&event(id, at(10, id as u32))).unwrap();
        }
        let removed = ledger.delete_events(&[2, 3, 404]).unwrap();
        assert_eq!(removed.iter().map(|e| e.history_id).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(ledger.event_count().unwrap(), 1);
        assert!(ledger.delete_events(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_events_by_ids_reads_without_removing() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.mark_accepted(&event(1, at(10, 1))).unwrap();
        ledger.mark_accepted(&event(2, at(10, 2))).unwrap();

        let found = ledger.events_by_ids(&[2, 404]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].watched_at, at(10, 2));
        assert_eq!(ledger.event_count().unwrap(), 2);
    }

    #[test]
    fn test_ids_in_window_inclusive_bounds() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.mark_accepted(&event(1, at(1, 0))).unwrap();
        ledger.mark_accepted(&event(2, at(5, 0))).unwrap();
        ledger.mark_accepted(&event(3, at(8, 0))).unwrap();
        ledger.mark_accepted(&event(4, at(8, 0) + Duration::seconds(1))).unwrap();

        let ids = ledger.ids_in_window(&HistoryWindow::between(at(1, 0), at(8, 0))).unwrap();
        assert_eq!(ids, BTreeSet::from([1, 2, 3]));
        assert_eq!(ledger.ids_in_window(&HistoryWindow::unbounded()).unwrap().len(), 4);
    }

    #[test]
    fn test_reset_all_clears_everything() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.mark_accepted(&event(1, at(1, 0))).unwrap();
        ledger.mark_backfill_complete(at(2, 0)).unwrap();
        ledger
            .set_cursor(&Cursor {
                mode: SyncMode::Reconcile,
                last_successful_at: at(2, 0),
                high_water_watched_at: None,
                window_start: None,
            })
            .unwrap();

        ledger.reset_all().unwrap();
        let summary = ledger.summary().unwrap();
        assert_eq!(summary.accepted_events, 0);
        assert!(summary.cursors.is_empty());
        assert!(!summary.backfill.completed);
    }

    #[test]
    fn test_reopen_persists_and_skips_applied_migrations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("state.db");
        {
            let ledger = Ledger::open(&path).unwrap();
            ledger.mark_accepted(&event(1, at(3, 0))).unwrap();
        }
        let ledger = Ledger::open(&path).unwrap();
        assert!(ledger.is_known(1).unwrap());
        let summary = ledger.summary().unwrap();
        assert_eq!(summary.oldest_watched_at, Some(at(3, 0)));
    }
}
