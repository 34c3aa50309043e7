//! # Trajectory Store
//!
//! SQLite-backed repository for users, activities and trackpoints.
//!
//! The store is an explicitly constructed handle: open it at pipeline start,
//! pass it to whatever needs it, and [`SqliteStore::close`] it at the end.
//!
//! ## Tables
//!
//! - `users` - one row per dataset user
//! - `activities` - one row per accepted raw file, unique on `(user_id, source_id)`
//! - `trackpoints` - ordered samples, keyed by `(activity_id, seq)`
//! - `ingest_checkpoints` - durable per-file markers, written in the same
//!   transaction as the activity they confirm

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime};
use log::{debug, info};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::error::{IngestError, Result};
use crate::segment::ActivityDraft;
use crate::{Activity, Trackpoint, TransportMode, User};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Types
// ============================================================================

/// Identifies the activity a streamed trackpoint belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActivityKey {
    pub activity_id: i64,
    pub user_id: String,
}

/// Activity-level selection applied before trackpoints are streamed.
///
/// The time window applies to the activity start: `start_from <= start < start_before`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivityFilter {
    pub user_id: Option<String>,
    pub mode: Option<TransportMode>,
    pub start_from: Option<NaiveDateTime>,
    pub start_before: Option<NaiveDateTime>,
}

impl ActivityFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn mode(mut self, mode: TransportMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn window(mut self, start_from: NaiveDateTime, start_before: NaiveDateTime) -> Self {
        self.start_from = Some(start_from);
        self.start_before = Some(start_before);
        self
    }

    pub fn matches(&self, activity: &Activity) -> bool {
        self.user_id.as_deref().map_or(true, |u| u == activity.user_id)
            && self
                .mode
                .map_or(true, |m| activity.transportation_mode == Some(m))
            && self
                .start_from
                .map_or(true, |from| activity.start_date_time >= from)
            && self
                .start_before
                .map_or(true, |before| activity.start_date_time < before)
    }

    /// SQL predicate over the `a` (activities) alias, plus its bound values.
    fn to_sql(&self) -> (String, Vec<Value>) {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(user_id) = &self.user_id {
            clauses.push("a.user_id = ?");
            values.push(Value::Text(user_id.clone()));
        }
        if let Some(mode) = self.mode {
            clauses.push("a.transportation_mode = ?");
            values.push(Value::Text(mode.as_str().to_string()));
        }
        if let Some(from) = self.start_from {
            clauses.push("a.start_date_time >= ?");
            values.push(Value::Integer(to_epoch(from)));
        }
        if let Some(before) = self.start_before {
            clauses.push("a.start_date_time < ?");
            values.push(Value::Integer(to_epoch(before)));
        }
        if clauses.is_empty() {
            ("1 = 1".to_string(), values)
        } else {
            (clauses.join(" AND "), values)
        }
    }
}

/// Last durably committed unit of ingestion work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub user_id: String,
    pub source_id: String,
    pub activity_id: i64,
}

// ============================================================================
// Repository trait
// ============================================================================

/// Typed repository the ingestion pipeline and the analytics run against.
pub trait TrajectoryStore {
    fn user_exists(&self, user_id: &str) -> Result<bool>;

    /// Insert the user if absent. Returns `true` when a row was created.
    fn ensure_user(&mut self, user: &User) -> Result<bool>;

    /// Whether a raw file of this user has already been committed.
    fn is_ingested(&self, user_id: &str, source_id: &str) -> Result<bool>;

    /// Persist an activity, its trackpoints and its checkpoint atomically.
    fn save_activity(&mut self, user_id: &str, draft: &ActivityDraft) -> Result<Activity>;

    fn activities(&self, filter: &ActivityFilter) -> Result<Vec<Activity>>;

    /// Visit every trackpoint of the matching activities, ordered by
    /// (activity, timestamp, stored sequence).
    fn for_each_trackpoint(
        &self,
        filter: &ActivityFilter,
        visit: &mut dyn FnMut(&ActivityKey, &Trackpoint) -> Result<()>,
    ) -> Result<()>;
}

// ============================================================================
// SQLite implementation
// ============================================================================

pub struct SqliteStore {
    db: Connection,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Connection::open(path.as_ref())?;
        info!("[Store] Opened {}", path.as_ref().display());
        Self::from_connection(db)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(db: Connection) -> Result<Self> {
        db.busy_timeout(BUSY_TIMEOUT)?;
        Self::init_schema(&db)?;
        Ok(Self { db })
    }

    /// Close the underlying connection, surfacing any error.
    pub fn close(self) -> Result<()> {
        self.db.close().map_err(|(_, e)| IngestError::Store(e))
    }

    /// Raw connection for store-native aggregate queries.
    pub fn connection(&self) -> &Connection {
        &self.db
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                has_labels INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS activities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL REFERENCES users(id),
                source_id TEXT NOT NULL,
                transportation_mode TEXT,
                start_date_time INTEGER NOT NULL,
                end_date_time INTEGER NOT NULL,
                CHECK (start_date_time <= end_date_time),
                UNIQUE (user_id, source_id)
            );

            CREATE TABLE IF NOT EXISTS trackpoints (
                activity_id INTEGER NOT NULL REFERENCES activities(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                lat REAL NOT NULL CHECK (lat BETWEEN -90 AND 90),
                lon REAL NOT NULL CHECK (lon BETWEEN -180 AND 180),
                altitude INTEGER NOT NULL,
                date_days REAL NOT NULL,
                date_time INTEGER NOT NULL,
                PRIMARY KEY (activity_id, seq)
            );

            CREATE TABLE IF NOT EXISTS ingest_checkpoints (
                user_id TEXT NOT NULL,
                source_id TEXT NOT NULL,
                activity_id INTEGER NOT NULL REFERENCES activities(id) ON DELETE CASCADE,
                committed_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                PRIMARY KEY (user_id, source_id)
            );

            CREATE INDEX IF NOT EXISTS idx_activities_user ON activities(user_id);
            CREATE INDEX IF NOT EXISTS idx_activities_mode ON activities(transportation_mode);
            CREATE INDEX IF NOT EXISTS idx_trackpoints_time ON trackpoints(activity_id, date_time);
        "#,
        )?;
        Ok(())
    }

    pub fn user(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self
            .db
            .query_row(
                "SELECT id, has_labels FROM users WHERE id = ?",
                params![user_id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        has_labels: row.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn user_count(&self) -> Result<i64> {
        Ok(self
            .db
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?)
    }

    pub fn activity_count(&self) -> Result<i64> {
        Ok(self
            .db
            .query_row("SELECT COUNT(*) FROM activities", [], |row| row.get(0))?)
    }

    pub fn trackpoint_count(&self) -> Result<i64> {
        Ok(self
            .db
            .query_row("SELECT COUNT(*) FROM trackpoints", [], |row| row.get(0))?)
    }

    /// Stored trackpoints of one activity, in stored order.
    pub fn trackpoints(&self, activity_id: i64) -> Result<Vec<Trackpoint>> {
        let mut stmt = self.db.prepare(
            "SELECT lat, lon, altitude, date_days, date_time
             FROM trackpoints WHERE activity_id = ? ORDER BY seq",
        )?;
        let points = stmt
            .query_map(params![activity_id], |row| trackpoint_from_row(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(points)
    }

    /// The most recently committed checkpoint, if any.
    pub fn last_checkpoint(&self) -> Result<Option<Checkpoint>> {
        Ok(self
            .db
            .query_row(
                "SELECT user_id, source_id, activity_id FROM ingest_checkpoints
                 ORDER BY activity_id DESC LIMIT 1",
                [],
                |row| {
                    Ok(Checkpoint {
                        user_id: row.get(0)?,
                        source_id: row.get(1)?,
                        activity_id: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }
}

impl TrajectoryStore for SqliteStore {
    fn user_exists(&self, user_id: &str) -> Result<bool> {
        Ok(self.user(user_id)?.is_some())
    }

    fn ensure_user(&mut self, user: &User) -> Result<bool> {
        let inserted = self.db.execute(
            "INSERT OR IGNORE INTO users (id, has_labels) VALUES (?, ?)",
            params![user.id, user.has_labels],
        )?;
        Ok(inserted == 1)
    }

    fn is_ingested(&self, user_id: &str, source_id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .db
            .query_row(
                "SELECT 1 FROM ingest_checkpoints WHERE user_id = ? AND source_id = ?",
                params![user_id, source_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn save_activity(&mut self, user_id: &str, draft: &ActivityDraft) -> Result<Activity> {
        if draft.points.is_empty() {
            return Err(IngestError::CorruptRecord(format!(
                "activity {}/{} has no trackpoints",
                user_id, draft.source_id
            )));
        }

        // Dropping the transaction on any early return rolls everything back
        let tx = self.db.transaction()?;
        tx.execute(
            "INSERT INTO activities
                (user_id, source_id, transportation_mode, start_date_time, end_date_time)
             VALUES (?, ?, ?, ?, ?)",
            params![
                user_id,
                draft.source_id,
                draft.transportation_mode.map(|m| m.as_str()),
                to_epoch(draft.start),
                to_epoch(draft.end),
            ],
        )?;
        let activity_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO trackpoints
                    (activity_id, seq, lat, lon, altitude, date_days, date_time)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?;
            for (seq, tp) in draft.points.iter().enumerate() {
                stmt.execute(params![
                    activity_id,
                    seq as i64,
                    tp.lat,
                    tp.lon,
                    tp.altitude,
                    tp.date_days,
                    to_epoch(tp.date_time),
                ])?;
            }
        }

        tx.execute(
            "INSERT INTO ingest_checkpoints (user_id, source_id, activity_id) VALUES (?, ?, ?)",
            params![user_id, draft.source_id, activity_id],
        )?;
        tx.commit()?;

        debug!(
            "[Store] Saved activity {} ({}/{}, {} trackpoints)",
            activity_id,
            user_id,
            draft.source_id,
            draft.points.len()
        );

        Ok(Activity {
            id: activity_id,
            user_id: user_id.to_string(),
            source_id: draft.source_id.clone(),
            transportation_mode: draft.transportation_mode,
            start_date_time: draft.start,
            end_date_time: draft.end,
        })
    }

    fn activities(&self, filter: &ActivityFilter) -> Result<Vec<Activity>> {
        let (predicate, values) = filter.to_sql();
        let sql = format!(
            "SELECT a.id, a.user_id, a.source_id, a.transportation_mode,
                    a.start_date_time, a.end_date_time
             FROM activities a WHERE {} ORDER BY a.id",
            predicate
        );
        let mut stmt = self.db.prepare(&sql)?;
        let activities = stmt
            .query_map(params_from_iter(values), activity_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(activities)
    }

    fn for_each_trackpoint(
        &self,
        filter: &ActivityFilter,
        visit: &mut dyn FnMut(&ActivityKey, &Trackpoint) -> Result<()>,
    ) -> Result<()> {
        let (predicate, values) = filter.to_sql();
        let sql = format!(
            "SELECT a.id, a.user_id, t.lat, t.lon, t.altitude, t.date_days, t.date_time
             FROM trackpoints t JOIN activities a ON a.id = t.activity_id
             WHERE {}
             ORDER BY t.activity_id, t.date_time, t.seq",
            predicate
        );
        let mut stmt = self.db.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(values))?;

        let mut current: Option<ActivityKey> = None;
        while let Some(row) = rows.next()? {
            let activity_id: i64 = row.get(0)?;
            if current.as_ref().map_or(true, |k| k.activity_id != activity_id) {
                current = Some(ActivityKey {
                    activity_id,
                    user_id: row.get(1)?,
                });
            }
            let point = trackpoint_from_row(row, 2)?;
            if let Some(key) = &current {
                visit(key, &point)?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Row mapping
// ============================================================================

pub(crate) fn to_epoch(t: NaiveDateTime) -> i64 {
    t.and_utc().timestamp()
}

pub(crate) fn from_epoch(secs: i64, idx: usize) -> rusqlite::Result<NaiveDateTime> {
    DateTime::from_timestamp(secs, 0)
        .map(|t| t.naive_utc())
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs))
}

fn trackpoint_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Trackpoint> {
    Ok(Trackpoint {
        lat: row.get(offset)?,
        lon: row.get(offset + 1)?,
        altitude: row.get(offset + 2)?,
        date_days: row.get(offset + 3)?,
        date_time: from_epoch(row.get(offset + 4)?, offset + 4)?,
    })
}

fn activity_from_row(row: &Row<'_>) -> rusqlite::Result<Activity> {
    let mode: Option<String> = row.get(3)?;
    let transportation_mode = mode
        .map(|m| {
            m.parse::<TransportMode>()
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))
        })
        .transpose()?;
    Ok(Activity {
        id: row.get(0)?,
        user_id: row.get(1)?,
        source_id: row.get(2)?,
        transportation_mode,
        start_date_time: from_epoch(row.get(4)?, 4)?,
        end_date_time: from_epoch(row.get(5)?, 5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{at, point};

    fn draft(source_id: &str, mode: Option<TransportMode>, points: Vec<Trackpoint>) -> ActivityDraft {
        ActivityDraft {
            source_id: source_id.to_string(),
            transportation_mode: mode,
            start: points.first().unwrap().date_time,
            end: points.last().unwrap().date_time,
            points,
        }
    }

    fn user(id: &str) -> User {
        User {
            id: id.to_string(),
            has_labels: false,
        }
    }

    fn walk() -> Vec<Trackpoint> {
        vec![
            point(39.90, 116.30, 100, at(10, 0, 0)),
            point(39.91, 116.31, 120, at(10, 0, 5)),
            point(39.92, 116.32, 110, at(10, 0, 10)),
        ]
    }

    #[test]
    fn test_ensure_user_idempotent() {
        let mut store = SqliteStore::in_memory().unwrap();
        assert!(store.ensure_user(&user("000")).unwrap());
        assert!(!store.ensure_user(&user("000")).unwrap());
        assert!(store.user_exists("000").unwrap());
        assert!(!store.user_exists("001").unwrap());
        assert_eq!(store.user_count().unwrap(), 1);
    }

    #[test]
    fn test_save_activity_round_trip() {
        let mut store = SqliteStore::in_memory().unwrap();
        store.ensure_user(&user("010")).unwrap();
        let saved = store
            .save_activity("010", &draft("a", Some(TransportMode::Bus), walk()))
            .unwrap();

        assert_eq!(saved.start_date_time, at(10, 0, 0));
        assert_eq!(saved.end_date_time, at(10, 0, 10));
        assert_eq!(store.trackpoints(saved.id).unwrap(), walk());
        assert!(store.is_ingested("010", "a").unwrap());
        assert!(!store.is_ingested("010", "b").unwrap());

        let listed = store.activities(&ActivityFilter::all()).unwrap();
        assert_eq!(listed, vec![saved.clone()]);

        let checkpoint = store.last_checkpoint().unwrap().unwrap();
        assert_eq!(checkpoint.activity_id, saved.id);
        assert_eq!(checkpoint.source_id, "a");
    }

    #[test]
    fn test_failed_trackpoint_write_leaves_no_orphan() {
        let mut store = SqliteStore::in_memory().unwrap();
        store.ensure_user(&user("010")).unwrap();
        let mut points = walk();
        // Violates the latitude CHECK constraint on the dependent write
        points[2].lat = 120.0;

        let result = store.save_activity("010", &draft("bad", None, points));
        assert!(matches!(result, Err(IngestError::Store(_))));
        assert_eq!(store.activity_count().unwrap(), 0);
        assert_eq!(store.trackpoint_count().unwrap(), 0);
        assert!(!store.is_ingested("010", "bad").unwrap());
        assert!(store.last_checkpoint().unwrap().is_none());
    }

    #[test]
    fn test_filter_selects_activities() {
        let mut store = SqliteStore::in_memory().unwrap();
        store.ensure_user(&user("010")).unwrap();
        store.ensure_user(&user("011")).unwrap();
        store
            .save_activity("010", &draft("a", Some(TransportMode::Walk), walk()))
            .unwrap();
        store
            .save_activity("011", &draft("b", Some(TransportMode::Walk), walk()))
            .unwrap();
        store.save_activity("010", &draft("c", None, walk())).unwrap();

        let filter = ActivityFilter::all().user("010").mode(TransportMode::Walk);
        let found = store.activities(&filter).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].source_id, "a");
        assert!(found.iter().all(|a| filter.matches(a)));

        let outside = ActivityFilter::all().window(at(11, 0, 0), at(12, 0, 0));
        assert!(store.activities(&outside).unwrap().is_empty());
    }

    #[test]
    fn test_stream_grouped_by_activity_in_time_order() {
        let mut store = SqliteStore::in_memory().unwrap();
        store.ensure_user(&user("010")).unwrap();
        store.ensure_user(&user("011")).unwrap();
        store.save_activity("011", &draft("x", None, walk())).unwrap();
        store.save_activity("010", &draft("y", None, walk())).unwrap();

        let mut seen: Vec<(i64, String, NaiveDateTime)> = Vec::new();
        store
            .for_each_trackpoint(&ActivityFilter::all(), &mut |key, tp| {
                seen.push((key.activity_id, key.user_id.clone(), tp.date_time));
                Ok(())
            })
            .unwrap();

        assert_eq!(seen.len(), 6);
        assert!(seen.windows(2).all(|w| (w[0].0, w[0].2) <= (w[1].0, w[1].2)));
        assert_eq!(seen[0].1, "011");
        assert_eq!(seen[5].1, "010");
    }
}
