//! Configuration for ingestion and analytics.
//!
//! Both configs have defaults matching the GeoLife dataset conventions and can
//! be loaded from a JSON file. Missing fields fall back to their defaults.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};
use crate::geo_utils::RegionBox;

/// Number of header lines at the top of every raw trajectory file.
pub const PLT_HEADER_LINES: usize = 6;

/// Activities with more trackpoints than this are rejected.
pub const MAX_TRACKPOINTS: usize = 2500;

/// Consecutive points this far apart (or more) mark a recording gap.
pub const MAX_GAP_SECONDS: i64 = 5 * 60;

/// What to do with a raw line that cannot be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedLinePolicy {
    /// Drop the whole file: a corrupt required field invalidates the trip
    #[default]
    RejectFile,
    /// Drop only the offending line and keep going
    SkipLine,
}

/// Operator-supplied position to resume ingestion from.
///
/// `activity` is the 1-indexed position of the raw file within the user's
/// sorted file listing. Users sorting before `user_id` are skipped entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeFrom {
    pub user_id: String,
    pub activity: usize,
}

/// Configuration for the ingestion pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Dataset root holding one directory per user
    pub data_root: PathBuf,
    /// Optional file listing ids of users with labels, one per line.
    /// When absent, a user has labels iff `labels.txt` exists.
    pub labeled_ids: Option<PathBuf>,
    pub header_lines: usize,
    pub max_trackpoints: usize,
    pub max_gap_seconds: i64,
    pub malformed_lines: MalformedLinePolicy,
    pub resume: Option<ResumeFrom>,
}

impl IngestConfig {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            ..Self::default()
        }
    }

    pub fn with_resume(mut self, user_id: impl Into<String>, activity: usize) -> Self {
        self.resume = Some(ResumeFrom {
            user_id: user_id.into(),
            activity,
        });
        self
    }

    pub fn max_gap(&self) -> Result<Duration> {
        gap_duration(self.max_gap_seconds)
    }

    /// Reject settings the pipeline cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_trackpoints == 0 {
            return Err(IngestError::Config("max_trackpoints must be positive".into()));
        }
        self.max_gap()?;
        if let Some(resume) = &self.resume {
            if resume.activity == 0 {
                return Err(IngestError::Config(
                    "resume activity position is 1-indexed".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = load_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("Data"),
            labeled_ids: None,
            header_lines: PLT_HEADER_LINES,
            max_trackpoints: MAX_TRACKPOINTS,
            max_gap_seconds: MAX_GAP_SECONDS,
            malformed_lines: MalformedLinePolicy::default(),
            resume: None,
        }
    }
}

/// Configuration for the analytics reducers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Altitudes below this (feet) are ignored by the altitude-gain reducer
    pub min_altitude: i32,
    /// Altitudes above this (feet) are ignored by the altitude-gain reducer
    pub max_altitude: i32,
    /// Single increases of this size or more are treated as glitches
    pub max_altitude_step: i32,
    pub feet_to_meters: f64,
    /// Number of users in the altitude-gain ranking
    pub top_n: usize,
    pub max_gap_seconds: i64,
    /// Point of interest for region membership
    pub region: RegionBox,
}

impl AnalyticsConfig {
    pub fn max_gap(&self) -> Result<Duration> {
        gap_duration(self.max_gap_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_altitude > self.max_altitude {
            return Err(IngestError::Config(
                "min_altitude must not exceed max_altitude".into(),
            ));
        }
        if self.max_altitude_step <= 0 {
            return Err(IngestError::Config("max_altitude_step must be positive".into()));
        }
        if !self.feet_to_meters.is_finite() || self.feet_to_meters <= 0.0 {
            return Err(IngestError::Config("feet_to_meters must be positive".into()));
        }
        if !self.region.tolerance.is_finite() || self.region.tolerance < 0.0 {
            return Err(IngestError::Config("region tolerance must be non-negative".into()));
        }
        self.max_gap()?;
        Ok(())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = load_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            min_altitude: -1292,
            max_altitude: 45000,
            max_altitude_step: 3000,
            feet_to_meters: 0.3048,
            top_n: 20,
            max_gap_seconds: MAX_GAP_SECONDS,
            region: RegionBox::forbidden_city(),
        }
    }
}

/// A strictly positive gap threshold that fits a [`Duration`].
fn gap_duration(seconds: i64) -> Result<Duration> {
    if seconds <= 0 {
        return Err(IngestError::Config("max_gap_seconds must be positive".into()));
    }
    Duration::try_seconds(seconds).ok_or_else(|| {
        IngestError::Config(format!("max_gap_seconds {} is out of range", seconds))
    })
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).map_err(|e| IngestError::io(path, e))?;
    serde_json::from_str(&text)
        .map_err(|e| IngestError::Config(format!("{}: {}", path.display(), e)))
}
