//! Segmentation of a user's raw trajectory files into candidate activities.
//!
//! Every raw file is one candidate activity. A candidate is rejected when it
//! has no valid samples, more than the configured maximum, or a recording gap
//! between two consecutive samples. Surviving candidates get their mode from
//! the user's label file. Nothing here touches the store.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDateTime};
use log::{info, warn};

use crate::config::{IngestConfig, MalformedLinePolicy};
use crate::error::{IngestError, Result};
use crate::labels::LabelMatcher;
use crate::parser::PointParser;
use crate::{Trackpoint, TransportMode};

/// Directory inside a user directory holding the raw files.
pub const TRAJECTORY_DIR: &str = "Trajectory";

const RAW_EXTENSION: &str = "plt";

/// One raw file of a user, with its position in the sorted listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// 1-indexed position within the user's sorted file listing
    pub position: usize,
    /// File name, stable across runs
    pub source_id: String,
    pub path: PathBuf,
}

/// An accepted activity, ready to be persisted.
///
/// `start` and `end` are the first and last point's timestamps and `points`
/// is never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityDraft {
    pub source_id: String,
    pub transportation_mode: Option<TransportMode>,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub points: Vec<Trackpoint>,
}

/// Why a raw file did not become an activity.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// No valid samples after filtering
    Empty,
    TooManyPoints { count: usize, max: usize },
    /// Two consecutive samples are at least the maximum gap apart
    TemporalGap {
        after: NaiveDateTime,
        gap_seconds: i64,
    },
    /// A sample is earlier than the one before it
    OutOfOrder { at: NaiveDateTime },
    /// A line could not be parsed and the policy drops the file
    Malformed(String),
    /// The file could not be read
    Unreadable(String),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Empty => write!(f, "no valid trackpoints"),
            Rejection::TooManyPoints { count, max } => {
                write!(f, "more than {} trackpoints (read {})", max, count)
            }
            Rejection::TemporalGap { after, gap_seconds } => {
                write!(f, "{}s recording gap after {}", gap_seconds, after)
            }
            Rejection::OutOfOrder { at } => write!(f, "timestamp goes backwards at {}", at),
            Rejection::Malformed(message) => write!(f, "malformed: {}", message),
            Rejection::Unreadable(message) => write!(f, "unreadable: {}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SegmentOutcome {
    Accepted(ActivityDraft),
    Rejected(Rejection),
}

impl SegmentOutcome {
    pub fn accepted(self) -> Option<ActivityDraft> {
        match self {
            SegmentOutcome::Accepted(draft) => Some(draft),
            SegmentOutcome::Rejected(_) => None,
        }
    }
}

/// Turns raw files into [`ActivityDraft`]s.
#[derive(Debug, Clone)]
pub struct ActivitySegmenter {
    header_lines: usize,
    max_trackpoints: usize,
    max_gap: Duration,
    malformed_lines: MalformedLinePolicy,
}

impl ActivitySegmenter {
    pub fn new(config: &IngestConfig) -> Result<Self> {
        Ok(Self {
            header_lines: config.header_lines,
            max_trackpoints: config.max_trackpoints,
            max_gap: config.max_gap()?,
            malformed_lines: config.malformed_lines,
        })
    }

    /// List a user's raw files, sorted by file name.
    ///
    /// Sorting makes positions reproducible regardless of the order the
    /// filesystem returns entries in. The source id is the full file name, so
    /// `x.plt` and `x.PLT` stay distinct activities.
    pub fn source_files(user_dir: &Path) -> Result<Vec<SourceFile>> {
        let dir = user_dir.join(TRAJECTORY_DIR);
        let entries = fs::read_dir(&dir).map_err(|e| IngestError::io(&dir, e))?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| IngestError::io(&dir, e))?;
            let path = entry.path();
            let is_raw = path
                .extension()
                .map_or(false, |ext| ext.eq_ignore_ascii_case(RAW_EXTENSION));
            if is_raw && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        Ok(paths
            .into_iter()
            .enumerate()
            .map(|(i, path)| SourceFile {
                position: i + 1,
                source_id: path
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                path,
            })
            .collect())
    }

    /// Parse and validate one raw file, then look up its mode.
    pub fn segment_file(&self, file: &SourceFile, labels: &LabelMatcher) -> SegmentOutcome {
        let outcome = match self.collect_points(&file.path) {
            Ok(points) => self.build_draft(&file.source_id, points, labels),
            Err(rejection) => SegmentOutcome::Rejected(rejection),
        };
        if let SegmentOutcome::Rejected(reason) = &outcome {
            info!(
                "[Segment] Skipping {}: {}",
                file.path.display(),
                reason
            );
        }
        outcome
    }

    /// Read valid points, stopping early once the file is known to be rejected.
    fn collect_points(&self, path: &Path) -> std::result::Result<Vec<Trackpoint>, Rejection> {
        let reader = PointParser::new(path)
            .with_header_lines(self.header_lines)
            .open()
            .map_err(|e| Rejection::Unreadable(e.to_string()))?;

        let mut points: Vec<Trackpoint> = Vec::new();
        for item in reader {
            let point = match item {
                Ok(point) => point,
                Err(e @ IngestError::MalformedLine { .. }) => match self.malformed_lines {
                    MalformedLinePolicy::RejectFile => {
                        return Err(Rejection::Malformed(e.to_string()))
                    }
                    MalformedLinePolicy::SkipLine => {
                        warn!("[Segment] Dropping line: {}", e);
                        continue;
                    }
                },
                Err(e) => return Err(Rejection::Unreadable(e.to_string())),
            };

            if let Some(prev) = points.last() {
                check_step(prev, &point, self.max_gap)?;
            }
            points.push(point);

            if points.len() > self.max_trackpoints {
                return Err(Rejection::TooManyPoints {
                    count: points.len(),
                    max: self.max_trackpoints,
                });
            }
        }
        Ok(points)
    }

    fn build_draft(
        &self,
        source_id: &str,
        points: Vec<Trackpoint>,
        labels: &LabelMatcher,
    ) -> SegmentOutcome {
        let (Some(first), Some(last)) = (points.first(), points.last()) else {
            return SegmentOutcome::Rejected(Rejection::Empty);
        };
        let start = first.date_time;
        let end = last.date_time;
        SegmentOutcome::Accepted(ActivityDraft {
            source_id: source_id.to_string(),
            transportation_mode: labels.match_interval(start, end),
            start,
            end,
            points,
        })
    }

    /// Validate an already-parsed point sequence against the same rules.
    pub fn check_points(&self, points: &[Trackpoint]) -> std::result::Result<(), Rejection> {
        if points.is_empty() {
            return Err(Rejection::Empty);
        }
        if points.len() > self.max_trackpoints {
            return Err(Rejection::TooManyPoints {
                count: points.len(),
                max: self.max_trackpoints,
            });
        }
        points
            .windows(2)
            .try_for_each(|w| check_step(&w[0], &w[1], self.max_gap))
    }
}

fn check_step(
    prev: &Trackpoint,
    next: &Trackpoint,
    max_gap: Duration,
) -> std::result::Result<(), Rejection> {
    let delta = next.date_time - prev.date_time;
    if delta < Duration::zero() {
        return Err(Rejection::OutOfOrder { at: next.date_time });
    }
    if delta >= max_gap {
        return Err(Rejection::TemporalGap {
            after: prev.date_time,
            gap_seconds: delta.num_seconds(),
        });
    }
    Ok(())
}
