//! Storage Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::{Path, PathBuf};

/// A storage error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
/// Whatever the variant, a failed move never removes the source file.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The source disappeared before (or while) we got to it.
    #[display("source file not found: {}", _0.display())]
    SourceMissing(#[error(not(source))] PathBuf),
    /// The source exists but isn't a regular file.
    #[display("source is not a regular file: {}", _0.display())]
    NotAFile(#[error(not(source))] PathBuf),
    /// Another process kept the source locked through every retry.
    #[display("source file is locked: {}", _0.display())]
    LockedSource(#[error(not(source))] PathBuf),
    /// The destination directory (or a file inside it) could not be created.
    #[display("could not create destination: {}", _0.display())]
    DestinationCreateFailed(#[error(not(source))] PathBuf),
    /// Every candidate name in the destination directory is taken.
    #[display("no free file name for: {}", _0.display())]
    CollisionUnresolved(#[error(not(source))] PathBuf),
    /// A cross-volume copy didn't hash the same as its source.
    #[display("copy verification failed: {}", _0.display())]
    Verification(#[error(not(source))] PathBuf),
    /// Path contains invalid components or escapes its root.
    #[display("invalid path: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockedSource(_) | Self::Io(_) | Self::Verification(_))
    }

    /// Maps an I/O error about `path` onto the most specific variant.
    pub(crate) fn source_io(err: IoError, path: &Path) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::SourceMissing(path.to_path_buf()),
            _ => Self::Io(err),
        }
    }
}
