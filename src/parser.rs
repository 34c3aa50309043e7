//! Raw trajectory (`.plt`) parsing.
//!
//! A raw file starts with a fixed header block, followed by one sample per line:
//!
//! ```text
//! 39.984702,116.318417,0,492,39744.1201851852,2008-10-23,02:53:04
//! ```
//!
//! Fields are latitude, longitude, an unused flag, altitude in feet, fractional
//! days since 1899-12-30, date and time. Samples with out-of-range coordinates
//! or the unknown-altitude sentinel are dropped silently; lines that cannot be
//! parsed are reported as errors so the caller can decide what to discard.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use chrono::NaiveDateTime;

use crate::config::PLT_HEADER_LINES;
use crate::error::{IngestError, Result};
use crate::Trackpoint;

const FIELD_COUNT: usize = 7;
const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Handle on one raw trajectory file.
///
/// Each call to [`PointParser::open`] starts a fresh pass over the file, so a
/// parser can be iterated any number of times.
#[derive(Debug, Clone)]
pub struct PointParser {
    path: PathBuf,
    header_lines: usize,
}

impl PointParser {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            header_lines: PLT_HEADER_LINES,
        }
    }

    pub fn with_header_lines(mut self, header_lines: usize) -> Self {
        self.header_lines = header_lines;
        self
    }

    /// Open the file and return a lazy reader positioned after the header.
    pub fn open(&self) -> Result<PointReader<BufReader<File>>> {
        let file = File::open(&self.path).map_err(|e| IngestError::io(&self.path, e))?;
        Ok(PointReader::new(
            BufReader::new(file),
            self.path.clone(),
            self.header_lines,
        ))
    }
}

/// Lazy iterator over the valid samples of a raw trajectory stream.
///
/// Yields points in line order. Filtered samples are skipped and counted;
/// malformed lines yield `Err` and iteration may continue past them.
pub struct PointReader<R> {
    reader: R,
    source: PathBuf,
    header_lines: usize,
    line_no: usize,
    filtered: usize,
    buf: String,
}

impl<R: BufRead> PointReader<R> {
    pub fn new(reader: R, source: PathBuf, header_lines: usize) -> Self {
        Self {
            reader,
            source,
            header_lines,
            line_no: 0,
            filtered: 0,
            buf: String::new(),
        }
    }

    /// Number of samples dropped so far for range or sentinel violations.
    pub fn filtered(&self) -> usize {
        self.filtered
    }
}

impl<R: BufRead> Iterator for PointReader<R> {
    type Item = Result<Trackpoint>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(IngestError::io(&self.source, e))),
            }
            self.line_no += 1;

            if self.line_no <= self.header_lines {
                continue;
            }
            let line = self.buf.trim();
            if line.is_empty() {
                continue;
            }

            match parse_line(line) {
                Ok(point) if point.is_valid() => return Some(Ok(point)),
                Ok(_) => self.filtered += 1,
                Err(message) => {
                    return Some(Err(IngestError::malformed(
                        &self.source,
                        self.line_no,
                        message,
                    )))
                }
            }
        }
    }
}

/// Parse one data line. Range checks are left to [`Trackpoint::is_valid`].
pub fn parse_line(line: &str) -> std::result::Result<Trackpoint, String> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < FIELD_COUNT {
        return Err(format!(
            "expected {} fields, got {}",
            FIELD_COUNT,
            fields.len()
        ));
    }

    let lat = parse_f64(fields[0], "latitude")?;
    let lon = parse_f64(fields[1], "longitude")?;
    let altitude = parse_f64(fields[3], "altitude")?;
    if !altitude.is_finite() || altitude.abs() > i32::MAX as f64 {
        return Err(format!("altitude '{}' out of representable range", fields[3]));
    }
    let date_days = parse_f64(fields[4], "date_days")?;

    let stamp = format!("{} {}", fields[5], fields[6]);
    let date_time = NaiveDateTime::parse_from_str(&stamp, DATE_TIME_FORMAT)
        .map_err(|e| format!("bad timestamp '{}': {}", stamp, e))?;

    Ok(Trackpoint {
        lat,
        lon,
        altitude: altitude.round() as i32,
        date_days,
        date_time,
    })
}

fn parse_f64(field: &str, name: &str) -> std::result::Result<f64, String> {
    field
        .parse::<f64>()
        .map_err(|_| format!("bad {} '{}'", name, field))
}
