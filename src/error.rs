//! Unified error handling for the geolife-tracks library.
//!
//! Policy rejections (empty files, oversized files, recording gaps) and label
//! lookup misses are *not* errors; they are ordinary values returned by the
//! segmenter and the label matcher. This type covers the failures that abort a
//! unit of work: unreadable input, malformed records and store failures.

use std::path::PathBuf;

use thiserror::Error;

/// Unified error type for ingestion, storage and analytics operations.
#[derive(Debug, Error)]
pub enum IngestError {
    /// A raw trajectory or label line could not be parsed
    #[error("{}:{line}: malformed record: {message}", .path.display())]
    MalformedLine {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// Filesystem error while reading the dataset
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Persistence/storage error
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// A stored value could not be mapped back to a typed record
    #[error("corrupt stored record: {0}")]
    CorruptRecord(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl IngestError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IngestError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        IngestError::MalformedLine {
            path: path.into(),
            line,
            message: message.into(),
        }
    }

    /// True if the error came from the persistence layer.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, IngestError::Store(_) | IngestError::CorruptRecord(_))
    }
}

/// Result type alias for geolife-tracks operations.
pub type Result<T> = std::result::Result<T, IngestError>;
