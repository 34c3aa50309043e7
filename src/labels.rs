//! Transportation mode lookup from per-user label files.
//!
//! A label file has one header line followed by tab-separated entries:
//!
//! ```text
//! Start Time	End Time	Transportation Mode
//! 2008/04/02 11:24:21	2008/04/02 11:50:45	bus
//! ```
//!
//! An activity gets a mode only when both its start and end instants equal a
//! label entry's exactly. There is no tolerance window.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use log::{debug, warn};

use crate::error::{IngestError, Result};
use crate::TransportMode;

/// File name of the label file inside a user directory.
pub const LABELS_FILE: &str = "labels.txt";

const LABEL_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelEntry {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub mode: TransportMode,
}

/// Parsed label entries of one user.
#[derive(Debug, Clone, Default)]
pub struct LabelMatcher {
    entries: Vec<LabelEntry>,
}

impl LabelMatcher {
    /// A matcher that never matches, for users without a label file.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Path of the label file for a user directory.
    pub fn path_for(user_dir: &Path) -> PathBuf {
        user_dir.join(LABELS_FILE)
    }

    /// Load a label file. A missing file yields an empty matcher.
    pub fn load(path: &Path) -> Result<Self> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::empty()),
            Err(e) => return Err(IngestError::io(path, e)),
        };
        Self::from_reader(BufReader::new(file), path)
    }

    /// Parse label entries from any reader. Malformed or unknown-mode entries
    /// are skipped with a warning.
    pub fn from_reader<R: BufRead>(reader: R, source: &Path) -> Result<Self> {
        let mut entries = Vec::new();
        for (idx, line) in reader.lines().enumerate().skip(1) {
            let line = line.map_err(|e| IngestError::io(source, e))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_label_line(line) {
                Ok(entry) => entries.push(entry),
                Err(message) => warn!(
                    "[Labels] {}:{}: skipping label entry: {}",
                    source.display(),
                    idx + 1,
                    message
                ),
            }
        }
        debug!(
            "[Labels] Loaded {} label entries from {}",
            entries.len(),
            source.display()
        );
        Ok(Self { entries })
    }

    pub fn from_entries(entries: Vec<LabelEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mode of the first entry whose interval equals `[start, end]` exactly.
    pub fn match_interval(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Option<TransportMode> {
        self.entries
            .iter()
            .find(|entry| entry.start == start && entry.end == end)
            .map(|entry| entry.mode)
    }
}

fn parse_label_line(line: &str) -> std::result::Result<LabelEntry, String> {
    let mut fields = line.split('\t');
    let (Some(start), Some(end), Some(mode)) = (fields.next(), fields.next(), fields.next())
    else {
        return Err("expected 3 tab-separated fields".to_string());
    };

    let start = parse_label_time(start)?;
    let end = parse_label_time(end)?;
    let mode = mode.parse::<TransportMode>().map_err(|e| e.to_string())?;
    Ok(LabelEntry { start, end, mode })
}

fn parse_label_time(field: &str) -> std::result::Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(field.trim(), LABEL_TIME_FORMAT)
        .map_err(|e| format!("bad timestamp '{}': {}", field.trim(), e))
}
