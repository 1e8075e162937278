//! Ticket identifier extraction from file names.

use crate::consts::DEFAULT_TICKET_REGEX;
use crate::error::{ErrorKind, Result};
use crate::models::TicketId;
use exn::ResultExt;
use regex::Regex;
use std::path::Path;
use tracing::instrument;

/// Pulls a [`TicketId`] out of a file name using a pattern with exactly one
/// capture group around the ticket digits.
///
/// The pattern is only ever applied to the file name, never to the directory
/// part of a path: a download folder called `ticket-1` must not cause every
/// file inside it to be filed under ticket 1.
///
/// # Examples
///
/// ```
/// use docket_extract::Extractor;
///
/// let extractor = Extractor::default();
/// assert_eq!(extractor.extract("invoice_TICKET-4521.pdf").unwrap().as_str(), "4521");
/// assert!(extractor.extract("holiday-photo.jpg").is_none());
///
/// let custom = Extractor::new(r"^RM(\d+)_").unwrap();
/// assert_eq!(custom.extract("RM77_notes.txt").unwrap().as_str(), "77");
/// ```
#[derive(Debug, Clone)]
pub struct Extractor {
    pattern: Regex,
}

impl Default for Extractor {
    fn default() -> Self {
        Self { pattern: DEFAULT_TICKET_REGEX.clone() }
    }
}

impl Extractor {
    /// Compiles a custom pattern, failing fast on syntax errors or the wrong
    /// number of capture groups.
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern).or_raise(|| ErrorKind::InvalidPattern(pattern.to_string()))?;
        // `captures_len` counts the implicit whole-match group too.
        let groups = pattern.captures_len() - 1;
        if groups != 1 {
            exn::bail!(ErrorKind::CaptureGroups(groups));
        }
        Ok(Self { pattern })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Returns the first identifier found in `file_name`, if any.
    #[instrument(level = "trace", skip(self))]
    pub fn extract(&self, file_name: &str) -> Option<TicketId> {
        self.pattern
            .captures_iter(file_name)
            .filter_map(|captures| captures.get(1))
            // A custom pattern might capture something like `\w+`; only digit
            // runs are identifiers, so keep looking past anything else.
            .find_map(|m| m.as_str().parse().ok())
    }

    /// Same as [`extract`](Self::extract), but takes a path and only looks at
    /// its final component.
    pub fn extract_from_path(&self, path: impl AsRef<Path>) -> Option<TicketId> {
        let name = path.as_ref().file_name()?.to_string_lossy();
        self.extract(&name)
    }
}
