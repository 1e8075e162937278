//! Resolution Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.
//!
//! Every variant is an *expected* outcome of asking a remote service about a
//! ticket. Callers record them and move on; none of them should take down
//! whatever loop asked the question.

use derive_more::{Display, Error};

/// A resolution error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for resolution operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a ticket identifier could not be turned into ticket metadata.
#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The ticket doesn't exist (or isn't visible to this credential).
    #[display("ticket not found")]
    NotFound,
    /// The credential was missing, wrong, or lacks permission.
    #[display("unauthorized")]
    Unauthorized,
    /// No complete answer within the configured timeout.
    #[display("timed out")]
    Timeout,
    /// Connection refused, DNS failure, TLS failure, reset mid-response...
    #[display("service unreachable")]
    Unreachable,
    /// Any other non-success HTTP status.
    #[display("unexpected HTTP status {_0}")]
    Status(#[error(not(source))] u16),
    /// A success status, but the body isn't the JSON we expected.
    #[display("malformed response body")]
    Malformed,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Unreachable => true,
            Self::Status(code) => *code >= 500,
            Self::NotFound | Self::Unauthorized | Self::Malformed => false,
        }
    }

    pub(crate) fn from_status(status: u16) -> Self {
        match status {
            404 | 410 => Self::NotFound,
            401 | 403 => Self::Unauthorized,
            other => Self::Status(other),
        }
    }

    pub(crate) fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Malformed
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16())
        } else {
            Self::Unreachable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(404, ErrorKind::NotFound)]
    #[case(410, ErrorKind::NotFound)]
    #[case(401, ErrorKind::Unauthorized)]
    #[case(403, ErrorKind::Unauthorized)]
    #[case(500, ErrorKind::Status(500))]
    #[case(422, ErrorKind::Status(422))]
    fn test_from_status(#[case] status: u16, #[case] expected: ErrorKind) {
        assert_eq!(ErrorKind::from_status(status), expected);
    }

    #[test]
    fn test_retryable() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::Unreachable.is_retryable());
        assert!(ErrorKind::Status(503).is_retryable());
        assert!(!ErrorKind::Status(400).is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
        assert!(!ErrorKind::Unauthorized.is_retryable());
    }

    #[test]
    fn test_display() {
        assert_eq!(ErrorKind::NotFound.to_string(), "ticket not found");
        assert_eq!(ErrorKind::Status(502).to_string(), "unexpected HTTP status 502");
    }
}
