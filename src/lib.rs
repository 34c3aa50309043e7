//! # GeoLife Tracks
//!
//! Batch ingestion of raw GPS trajectory logs into a SQLite store of users,
//! activities and trackpoints, plus single-pass analytics over the stored tracks.
//!
//! This library provides:
//! - A lazy parser for raw `.plt` trajectory files
//! - Exact-interval transportation mode matching against per-user label files
//! - Activity segmentation with size and recording-gap filters
//! - A resumable, transactional ingestion pipeline
//! - Streaming reducers: distance, altitude gain, temporal anomalies, region visits
//! - Store-native aggregate queries (counts, top-N, mode tallies)
//!
//! ## Features
//!
//! - **`parallel`** - Enable parallel per-activity reduction with rayon
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use geolife_tracks::{IngestConfig, IngestionPipeline, SqliteStore};
//!
//! let mut store = SqliteStore::open("geolife.db").unwrap();
//! let config = IngestConfig::new("/data/geolife/Data");
//! let report = IngestionPipeline::new(&mut store, config).run().unwrap();
//! println!("{} activities ingested", report.activities_inserted);
//! store.close().unwrap();
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{IngestError, Result};

// Pipeline and analytics configuration
pub mod config;
pub use config::{AnalyticsConfig, IngestConfig, MalformedLinePolicy, ResumeFrom};

// Geographic utilities (haversine distance, bounding boxes)
pub mod geo_utils;
pub use geo_utils::{haversine_km, RegionBox};

// Raw trajectory file parsing
pub mod parser;
pub use parser::{PointParser, PointReader};

// Transportation mode label matching
pub mod labels;
pub use labels::LabelMatcher;

// Raw files -> candidate activities
pub mod segment;
pub use segment::{ActivityDraft, ActivitySegmenter, Rejection, SegmentOutcome};

// SQLite repository
pub mod store;
pub use store::{ActivityFilter, ActivityKey, SqliteStore, TrajectoryStore};

// Ingestion orchestration
pub mod ingest;
pub use ingest::{IngestReport, IngestionPipeline};

// Streaming reducers over grouped trackpoints
pub mod analytics;
pub use analytics::{
    ActivityReducer, AltitudeGainReducer, DistanceReducer, RegionMembershipReducer,
    TemporalAnomalyReducer, UserAltitudeGain,
};

// Store-native aggregate queries
pub mod queries;

// ============================================================================
// Core Types
// ============================================================================

/// Altitude value meaning "unknown" in raw trajectory files.
pub const UNKNOWN_ALTITUDE: i32 = -777;

/// A user of the dataset, one per raw-data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub has_labels: bool,
}

/// Transportation mode vocabulary used by the label files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Walk,
    Bike,
    Bus,
    Car,
    Taxi,
    Subway,
    Train,
    Airplane,
    Boat,
    Run,
    Motorcycle,
}

impl TransportMode {
    pub const ALL: [TransportMode; 11] = [
        TransportMode::Walk,
        TransportMode::Bike,
        TransportMode::Bus,
        TransportMode::Car,
        TransportMode::Taxi,
        TransportMode::Subway,
        TransportMode::Train,
        TransportMode::Airplane,
        TransportMode::Boat,
        TransportMode::Run,
        TransportMode::Motorcycle,
    ];

    /// The label token as written in label files and in the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Walk => "walk",
            TransportMode::Bike => "bike",
            TransportMode::Bus => "bus",
            TransportMode::Car => "car",
            TransportMode::Taxi => "taxi",
            TransportMode::Subway => "subway",
            TransportMode::Train => "train",
            TransportMode::Airplane => "airplane",
            TransportMode::Boat => "boat",
            TransportMode::Run => "run",
            TransportMode::Motorcycle => "motorcycle",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a label token is outside the known vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMode(pub String);

impl fmt::Display for UnknownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown transportation mode '{}'", self.0)
    }
}

impl std::error::Error for UnknownMode {}

impl FromStr for TransportMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let token = s.trim();
        TransportMode::ALL
            .iter()
            .copied()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(token))
            .ok_or_else(|| UnknownMode(token.to_string()))
    }
}

/// One GPS sample.
///
/// `altitude` is in feet, as recorded in the raw files. The activity
/// back-reference lives in the store, not on the point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trackpoint {
    pub lat: f64,
    pub lon: f64,
    pub altitude: i32,
    /// Fractional number of days since 1899-12-30
    pub date_days: f64,
    pub date_time: NaiveDateTime,
}

impl Trackpoint {
    /// Check if the point has in-range coordinates and a known altitude.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
            && self.altitude != UNKNOWN_ALTITUDE
    }
}

/// A stored activity: one contiguous recorded trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: i64,
    pub user_id: String,
    /// Raw file name the activity was ingested from
    pub source_id: String,
    pub transportation_mode: Option<TransportMode>,
    pub start_date_time: NaiveDateTime,
    pub end_date_time: NaiveDateTime,
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{NaiveDate, NaiveDateTime};

    use crate::Trackpoint;

    pub fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2008, 10, 23)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    pub fn point(lat: f64, lon: f64, altitude: i32, date_time: NaiveDateTime) -> Trackpoint {
        Trackpoint {
            lat,
            lon,
            altitude,
            date_days: 39744.0,
            date_time,
        }
    }
}
