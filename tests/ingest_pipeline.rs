//! End-to-end ingestion tests over a synthetic dataset directory.
//!
//! Each test lays out `<root>/<user>/Trajectory/*.plt` (and optionally
//! `labels.txt`) in a temp dir, ingests it into a SQLite store and checks
//! what landed in the store.

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use geolife_tracks::analytics::{
    invalid_activities_per_user, top_altitude_gain, total_distance_km, users_in_region,
};
use geolife_tracks::{
    Activity, ActivityDraft, ActivityFilter, ActivityKey, AnalyticsConfig, IngestConfig,
    IngestError, IngestionPipeline, RegionBox, Result, SqliteStore, Trackpoint, TrajectoryStore,
    TransportMode, User,
};
use tempfile::TempDir;

const HEADER: &str = "Geolife trajectory\nWGS 84\nAltitude is in Feet\nReserved 3\n0,2,255,My Track,0,0,2,8421376\n0\n";

fn base_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2008, 10, 23)
        .unwrap()
        .and_hms_opt(2, 53, 4)
        .unwrap()
}

/// A raw sample line.
fn sample(lat: f64, lon: f64, altitude: i32, t: NaiveDateTime) -> String {
    format!(
        "{},{},0,{},39744.12,{},{}",
        lat,
        lon,
        altitude,
        t.format("%Y-%m-%d"),
        t.format("%H:%M:%S")
    )
}

/// `count` samples 5 seconds apart starting at `start`.
fn steady_track(start: NaiveDateTime, count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            sample(
                39.98 + i as f64 * 1e-4,
                116.31,
                100 + i as i32,
                start + Duration::seconds(5 * i as i64),
            )
        })
        .collect()
}

fn write_plt(root: &Path, user: &str, name: &str, lines: &[String]) {
    let dir = root.join(user).join("Trajectory");
    fs::create_dir_all(&dir).unwrap();
    let mut f = fs::File::create(dir.join(name)).unwrap();
    f.write_all(HEADER.as_bytes()).unwrap();
    for line in lines {
        writeln!(f, "{}", line).unwrap();
    }
}

fn write_labels(root: &Path, user: &str, entries: &[(NaiveDateTime, NaiveDateTime, &str)]) {
    let mut text = String::from("Start Time\tEnd Time\tTransportation Mode\n");
    for (start, end, mode) in entries {
        text.push_str(&format!(
            "{}\t{}\t{}\n",
            start.format("%Y/%m/%d %H:%M:%S"),
            end.format("%Y/%m/%d %H:%M:%S"),
            mode
        ));
    }
    fs::write(root.join(user).join("labels.txt"), text).unwrap();
}

fn file_name(i: usize) -> String {
    format!("200810{:02}000000.plt", i)
}

/// SQLite store whose writes fail for one user.
struct FailingWrites {
    inner: SqliteStore,
    broken_user: String,
}

impl TrajectoryStore for FailingWrites {
    fn user_exists(&self, user_id: &str) -> Result<bool> {
        self.inner.user_exists(user_id)
    }

    fn ensure_user(&mut self, user: &User) -> Result<bool> {
        self.inner.ensure_user(user)
    }

    fn is_ingested(&self, user_id: &str, source_id: &str) -> Result<bool> {
        self.inner.is_ingested(user_id, source_id)
    }

    fn save_activity(&mut self, user_id: &str, draft: &ActivityDraft) -> Result<Activity> {
        if user_id == self.broken_user {
            return Err(IngestError::Store(rusqlite::Error::InvalidQuery));
        }
        self.inner.save_activity(user_id, draft)
    }

    fn activities(&self, filter: &ActivityFilter) -> Result<Vec<Activity>> {
        self.inner.activities(filter)
    }

    fn for_each_trackpoint(
        &self,
        filter: &ActivityFilter,
        visit: &mut dyn FnMut(&ActivityKey, &Trackpoint) -> Result<()>,
    ) -> Result<()> {
        self.inner.for_each_trackpoint(filter, visit)
    }
}

#[test]
fn test_round_trip_counts_and_bounds() {
    let tmp = TempDir::new().unwrap();
    let start = base_time();
    let mut lines = steady_track(start, 10);
    // Filtered samples never become trackpoints
    lines.insert(3, sample(39.98, 116.31, -777, start + Duration::seconds(12)));
    lines.insert(5, sample(95.0, 116.31, 100, start + Duration::seconds(13)));
    write_plt(tmp.path(), "000", &file_name(1), &lines);

    let mut store = SqliteStore::in_memory().unwrap();
    let report = IngestionPipeline::new(&mut store, IngestConfig::new(tmp.path()))
        .run()
        .unwrap();
    assert_eq!(report.activities_inserted, 1);
    assert_eq!(report.trackpoints_inserted, 10);

    let activities = store.activities(&ActivityFilter::all()).unwrap();
    assert_eq!(activities.len(), 1);
    let activity = &activities[0];
    let points = store.trackpoints(activity.id).unwrap();
    assert_eq!(points.len(), 10);
    assert_eq!(activity.start_date_time, points[0].date_time);
    assert_eq!(activity.end_date_time, points[9].date_time);
    assert!(points.windows(2).all(|w| w[0].date_time <= w[1].date_time));
    assert_eq!(activity.transportation_mode, None);
}

#[test]
fn test_rejections_never_persist() {
    let tmp = TempDir::new().unwrap();
    let start = base_time();

    // Recording gap of exactly five minutes
    let mut gapped = steady_track(start, 3);
    gapped.push(sample(39.98, 116.31, 100, start + Duration::seconds(10 + 300)));
    write_plt(tmp.path(), "000", &file_name(1), &gapped);
    // More than 2500 valid points
    write_plt(tmp.path(), "000", &file_name(2), &steady_track(start, 2501));
    // Header only
    write_plt(tmp.path(), "000", &file_name(3), &[]);
    // Exactly 2500 points is fine
    write_plt(tmp.path(), "000", &file_name(4), &steady_track(start, 2500));

    let mut store = SqliteStore::in_memory().unwrap();
    let report = IngestionPipeline::new(&mut store, IngestConfig::new(tmp.path()))
        .run()
        .unwrap();
    assert_eq!(report.files_rejected, 3);
    assert_eq!(report.activities_inserted, 1);
    let activities = store.activities(&ActivityFilter::all()).unwrap();
    assert_eq!(activities[0].source_id, "20081004000000.plt");
    assert_eq!(store.trackpoint_count().unwrap(), 2500);
}

#[test]
fn test_labels_matched_exactly() {
    let tmp = TempDir::new().unwrap();
    let start = base_time();
    let end = start + Duration::seconds(5 * 9);
    write_plt(tmp.path(), "010", &file_name(1), &steady_track(start, 10));
    let later = start + Duration::hours(2);
    write_plt(tmp.path(), "010", &file_name(2), &steady_track(later, 10));
    write_labels(
        tmp.path(),
        "010",
        &[
            (start, end, "taxi"),
            // Off by one second at the end: no match
            (later, later + Duration::seconds(44), "bus"),
        ],
    );

    let mut store = SqliteStore::in_memory().unwrap();
    IngestionPipeline::new(&mut store, IngestConfig::new(tmp.path()))
        .run()
        .unwrap();

    assert!(store.user("010").unwrap().unwrap().has_labels);
    let modes: Vec<Option<TransportMode>> = store
        .activities(&ActivityFilter::all())
        .unwrap()
        .into_iter()
        .map(|a| a.transportation_mode)
        .collect();
    assert_eq!(modes, vec![Some(TransportMode::Taxi), None]);
}

#[test]
fn test_resume_does_not_duplicate() {
    let tmp = TempDir::new().unwrap();
    let start = base_time();
    for i in 1..=4 {
        write_plt(
            tmp.path(),
            "010",
            &file_name(i),
            &steady_track(start + Duration::days(i as i64), 5),
        );
    }

    let mut store = SqliteStore::in_memory().unwrap();
    IngestionPipeline::new(&mut store, IngestConfig::new(tmp.path()))
        .run()
        .unwrap();
    assert_eq!(store.activity_count().unwrap(), 4);

    // The dataset grows; the operator restarts from the 5th activity of 010
    for i in 5..=6 {
        write_plt(
            tmp.path(),
            "010",
            &file_name(i),
            &steady_track(start + Duration::days(i as i64), 5),
        );
    }
    write_plt(tmp.path(), "005", &file_name(1), &steady_track(start, 5));
    write_plt(tmp.path(), "020", &file_name(1), &steady_track(start, 5));
    write_plt(tmp.path(), "020", &file_name(2), &steady_track(start, 5));

    let config = IngestConfig::new(tmp.path()).with_resume("010", 5);
    let report = IngestionPipeline::new(&mut store, config).run().unwrap();

    assert_eq!(report.files_before_resume, 4);
    assert_eq!(report.activities_inserted, 4);
    let of = |user: &str| {
        store
            .activities(&ActivityFilter::all().user(user))
            .unwrap()
            .len()
    };
    assert_eq!(of("010"), 6);
    assert_eq!(of("020"), 2);
    // Users before the resume point are not touched
    assert_eq!(of("005"), 0);
    assert!(!store.user_exists("005").unwrap());

    let checkpoint = store.last_checkpoint().unwrap().unwrap();
    assert_eq!(checkpoint.user_id, "020");
}

#[test]
fn test_malformed_file_isolated() {
    let tmp = TempDir::new().unwrap();
    let start = base_time();
    let mut broken = steady_track(start, 4);
    broken[2] = "39.98,116.31,0".to_string();
    write_plt(tmp.path(), "000", &file_name(1), &broken);
    write_plt(tmp.path(), "000", &file_name(2), &steady_track(start, 4));
    write_plt(tmp.path(), "001", &file_name(1), &steady_track(start, 4));

    let mut store = SqliteStore::in_memory().unwrap();
    let report = IngestionPipeline::new(&mut store, IngestConfig::new(tmp.path()))
        .run()
        .unwrap();
    assert_eq!(report.files_rejected, 1);
    assert_eq!(report.activities_inserted, 2);
    assert!(report.users_failed.is_empty());
}

#[test]
fn test_failed_user_does_not_block_others() {
    let tmp = TempDir::new().unwrap();
    let start = base_time();
    write_plt(tmp.path(), "000", &file_name(1), &steady_track(start, 4));
    write_plt(tmp.path(), "001", &file_name(1), &steady_track(start, 4));
    write_plt(tmp.path(), "001", &file_name(2), &steady_track(start, 4));
    write_plt(tmp.path(), "002", &file_name(1), &steady_track(start, 4));

    let mut store = FailingWrites {
        inner: SqliteStore::in_memory().unwrap(),
        broken_user: "001".to_string(),
    };
    let report = IngestionPipeline::new(&mut store, IngestConfig::new(tmp.path()))
        .run()
        .unwrap();

    assert_eq!(report.users_failed, vec!["001".to_string()]);
    assert_eq!(report.users_seen, 3);
    assert_eq!(report.activities_inserted, 2);
    assert!(!store.is_ingested("001", &file_name(1)).unwrap());
    assert!(store.is_ingested("002", &file_name(1)).unwrap());
    assert!(store
        .activities(&ActivityFilter::all().user("001"))
        .unwrap()
        .is_empty());
    assert_eq!(store.inner.last_checkpoint().unwrap().unwrap().user_id, "002");
}

#[test]
fn test_case_variant_files_are_separate_activities() {
    let tmp = TempDir::new().unwrap();
    let start = base_time();
    write_plt(tmp.path(), "000", "20081023.plt", &steady_track(start, 4));
    write_plt(
        tmp.path(),
        "000",
        "20081023.PLT",
        &steady_track(start + Duration::hours(3), 4),
    );

    let mut store = SqliteStore::in_memory().unwrap();
    let report = IngestionPipeline::new(&mut store, IngestConfig::new(tmp.path()))
        .run()
        .unwrap();
    assert_eq!(report.activities_inserted, 2);
    assert_eq!(report.files_already_ingested, 0);
    assert_eq!(store.activity_count().unwrap(), 2);
}

#[test]
fn test_analytics_over_ingested_store() {
    let tmp = TempDir::new().unwrap();
    let start = base_time();
    let one_km = (1000.0_f64 / 6_371_008.8).to_degrees();
    let region = RegionBox::forbidden_city();

    // Walk of exactly 1 km north, climbing 100 -> 150 -> 120 -> 180 ft
    let walk: Vec<String> = [(0.0, 100), (0.5, 150), (0.75, 120), (1.0, 180)]
        .iter()
        .enumerate()
        .map(|(i, (frac, alt))| {
            sample(
                region.center_lat + frac * one_km,
                region.center_lon,
                *alt,
                start + Duration::seconds(10 * i as i64),
            )
        })
        .collect();
    write_plt(tmp.path(), "042", &file_name(1), &walk);
    write_labels(
        tmp.path(),
        "042",
        &[(start, start + Duration::seconds(30), "walk")],
    );
    // Another user far away, untagged
    let far: Vec<String> = (0..3)
        .map(|i| sample(31.2, 121.5, 10, start + Duration::seconds(i * 5)))
        .collect();
    write_plt(tmp.path(), "043", &file_name(1), &far);

    let mut store = SqliteStore::in_memory().unwrap();
    IngestionPipeline::new(&mut store, IngestConfig::new(tmp.path()))
        .run()
        .unwrap();

    let window_start = NaiveDate::from_ymd_opt(2008, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
    let window_end = NaiveDate::from_ymd_opt(2009, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
    let filter = ActivityFilter::all()
        .user("042")
        .mode(TransportMode::Walk)
        .window(window_start, window_end);
    let km = total_distance_km(&store, &filter).unwrap();
    assert!((km - 1.0).abs() < 1e-6, "got {} km", km);

    let config = AnalyticsConfig::default();
    let gains = top_altitude_gain(&store, &config).unwrap();
    assert_eq!(gains.len(), 1);
    assert_eq!(gains[0].user_id, "042");
    assert_eq!(gains[0].gain_feet, 110);
    assert_eq!(gains[0].gain_meters, 34);

    // Gapped activities are rejected at ingestion, so none remain
    assert!(invalid_activities_per_user(&store, &config).unwrap().is_empty());

    let visitors = users_in_region(&store, region).unwrap();
    assert_eq!(visitors.into_iter().collect::<Vec<_>>(), vec!["042".to_string()]);
}
