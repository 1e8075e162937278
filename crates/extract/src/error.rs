//! Extraction Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// An extraction error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for extraction operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
/// Note that a file name *without* a ticket identifier is not an error at all.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The configured ticket pattern does not compile.
    #[display("invalid ticket pattern: {_0}")]
    InvalidPattern(#[error(not(source))] String),
    /// The pattern compiles but doesn't have exactly one capture group for
    /// the ticket digits.
    #[display("ticket pattern must have exactly one capture group, found {_0}")]
    CaptureGroups(#[error(not(source))] usize),
    /// A value that should be a ticket identifier isn't one.
    #[display("not a ticket identifier: {_0:?}")]
    InvalidIdentifier(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        // A pattern is either valid or it isn't.
        false
    }
}
