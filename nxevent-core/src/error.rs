//! Error types for nxevent-core.

use thiserror::Error;

/// Result type alias for nxevent operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for event loading.
#[derive(Error, Debug)]
pub enum Error {
    /// Pulse index table has no entries.
    #[error("empty event index table, cannot resolve pulse times")]
    EmptyEventIndex,

    /// Time unit not accepted for the given quantity.
    #[error("unsupported time unit '{unit}' for {context}")]
    UnsupportedTimeUnit { unit: String, context: String },

    /// Stored numeric type is not one of the supported kinds.
    #[error("unsupported data type {kind} for dataset '{dataset}'")]
    UnsupportedDataType { dataset: String, kind: String },

    /// Read or slice extends past the end of the available data.
    #[error("{what}: range start {start} count {count} exceeds length {len}")]
    OutOfRange {
        what: String,
        start: usize,
        count: usize,
        len: usize,
    },

    /// Event id maps to a negative global spectrum index.
    #[error("event id {id} is below bank offset {offset}")]
    InvalidEventId { id: i64, offset: i64 },

    /// Configuration error.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Unparseable absolute timestamp.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

impl Error {
    /// Builds an [`Error::OutOfRange`] for the named quantity.
    #[must_use]
    pub fn out_of_range(what: &str, start: usize, count: usize, len: usize) -> Self {
        Self::OutOfRange {
            what: what.to_string(),
            start,
            count,
            len,
        }
    }
}

/// Fails with [`Error::OutOfRange`] unless `start + count <= len`.
///
/// # Errors
/// Returns an error if the range is not fully contained in `0..len`.
pub fn check_range(what: &str, start: usize, count: usize, len: usize) -> Result<()> {
    match start.checked_add(count) {
        Some(end) if end <= len => Ok(()),
        _ => Err(Error::out_of_range(what, start, count, len)),
    }
}
