//! Store-native aggregate queries.
//!
//! These need no sequential logic, so each one is a single SQL statement run
//! by SQLite. Results are plain serializable records for reporting.

use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::error::{IngestError, Result};
use crate::store::SqliteStore;
use crate::TransportMode;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub users: i64,
    pub activities: i64,
    pub trackpoints: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserCount {
    pub user_id: String,
    pub activity_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModeCount {
    pub mode: TransportMode,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct YearCount {
    pub year: i32,
    pub activity_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YearHours {
    pub year: i32,
    pub total_hours: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserMode {
    pub user_id: String,
    pub most_used_mode: TransportMode,
}

/// Number of users, activities and trackpoints.
pub fn counts(store: &SqliteStore) -> Result<Counts> {
    Ok(Counts {
        users: store.user_count()?,
        activities: store.activity_count()?,
        trackpoints: store.trackpoint_count()?,
    })
}

/// Mean number of activities over users that have at least one.
pub fn average_activities_per_user(store: &SqliteStore) -> Result<Option<f64>> {
    Ok(store.connection().query_row(
        "SELECT AVG(n) FROM (SELECT COUNT(*) AS n FROM activities GROUP BY user_id)",
        [],
        |row| row.get(0),
    )?)
}

/// Users with the most activities, descending.
pub fn top_users_by_activities(store: &SqliteStore, limit: usize) -> Result<Vec<UserCount>> {
    let mut stmt = store.connection().prepare(
        "SELECT user_id, COUNT(*) AS n FROM activities
         GROUP BY user_id ORDER BY n DESC, user_id LIMIT ?",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| {
            Ok(UserCount {
                user_id: row.get(0)?,
                activity_count: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Distinct users with at least one activity of the given mode.
pub fn users_with_mode(store: &SqliteStore, mode: TransportMode) -> Result<Vec<String>> {
    let mut stmt = store.connection().prepare(
        "SELECT DISTINCT user_id FROM activities
         WHERE transportation_mode = ? ORDER BY user_id",
    )?;
    let rows = stmt
        .query_map(params![mode.as_str()], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(rows)
}

/// Activity count per labelled transportation mode, most used first.
pub fn mode_counts(store: &SqliteStore) -> Result<Vec<ModeCount>> {
    let mut stmt = store.connection().prepare(
        "SELECT transportation_mode, COUNT(*) AS n FROM activities
         WHERE transportation_mode IS NOT NULL
         GROUP BY transportation_mode ORDER BY n DESC, transportation_mode",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter()
        .map(|(mode, count)| Ok(ModeCount { mode: parse_mode(&mode)?, count }))
        .collect()
}

/// Year with the most activities (by start time).
pub fn busiest_year_by_activities(store: &SqliteStore) -> Result<Option<YearCount>> {
    Ok(store
        .connection()
        .query_row(
            "SELECT CAST(strftime('%Y', start_date_time, 'unixepoch') AS INTEGER) AS year,
                    COUNT(*) AS n
             FROM activities GROUP BY year ORDER BY n DESC, year LIMIT 1",
            [],
            |row| {
                Ok(YearCount {
                    year: row.get(0)?,
                    activity_count: row.get(1)?,
                })
            },
        )
        .optional()?)
}

/// Year with the most recorded hours (activity end minus start, by start year).
pub fn busiest_year_by_hours(store: &SqliteStore) -> Result<Option<YearHours>> {
    Ok(store
        .connection()
        .query_row(
            "SELECT CAST(strftime('%Y', start_date_time, 'unixepoch') AS INTEGER) AS year,
                    SUM(end_date_time - start_date_time) / 3600.0 AS hours
             FROM activities GROUP BY year ORDER BY hours DESC, year LIMIT 1",
            [],
            |row| {
                Ok(YearHours {
                    year: row.get(0)?,
                    total_hours: row.get(1)?,
                })
            },
        )
        .optional()?)
}

/// Most frequent labelled mode of every user with labelled activities.
///
/// Ties go to the alphabetically first mode.
pub fn most_used_mode_per_user(store: &SqliteStore) -> Result<Vec<UserMode>> {
    let mut stmt = store.connection().prepare(
        "SELECT user_id, transportation_mode, COUNT(*) AS n FROM activities
         WHERE transportation_mode IS NOT NULL
         GROUP BY user_id, transportation_mode
         ORDER BY user_id, n DESC, transportation_mode",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut result: Vec<UserMode> = Vec::new();
    for (user_id, mode) in rows {
        if result.last().map_or(false, |m| m.user_id == user_id) {
            continue;
        }
        result.push(UserMode {
            user_id,
            most_used_mode: parse_mode(&mode)?,
        });
    }
    Ok(result)
}

fn parse_mode(mode: &str) -> Result<TransportMode> {
    mode.parse()
        .map_err(|e: crate::UnknownMode| IngestError::CorruptRecord(e.to_string()))
}
