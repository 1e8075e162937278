//! Application Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// An application error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for application operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Settings are missing, unreadable or invalid.
    #[display("configuration error")]
    Config,
    /// The data directory, lock file or port file could not be used.
    #[display("could not set up the single-instance guard")]
    Instance,
    /// Talking to (or serving) the control channel failed.
    #[display("control channel error")]
    Control,
    /// The organizer failed while running.
    #[display("runtime error")]
    Runtime,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Control | Self::Runtime)
    }

    /// Process exit status: 2 for configuration problems, 1 for the rest.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config => 2,
            Self::Instance | Self::Control | Self::Runtime => 1,
        }
    }
}
