//! Library Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.
//!
//! Per-file problems (no identifier, unknown ticket, locked file...) are not
//! errors at this level: they become [`MoveRecord`](crate::MoveRecord)s. What
//! remains here is whatever stops the organizer itself from doing its job.

use derive_more::{Display, Error};

/// A library error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    #[display("issue with path generation from template")]
    Template,
    #[display("settings could not be loaded or are invalid")]
    Settings,
    #[display("monitored directory can no longer be watched")]
    WatcherFatal,
    #[display("could not write to the move journal")]
    Journal,
    #[display("could not read the monitored directory")]
    Scan,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::WatcherFatal | Self::Journal | Self::Scan => true,
            Self::Template | Self::Settings => false,
        }
    }
}
