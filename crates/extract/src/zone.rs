//! Windows "Mark of the Web" referrer parsing.
//!
//! Browsers on Windows attach a `Zone.Identifier` alternate data stream to
//! downloads, recording where the file came from:
//!
//! ```text
//! [ZoneTransfer]
//! ZoneId=3
//! ReferrerUrl=https://redmine.example.com/issues/4521
//! HostUrl=https://redmine.example.com/attachments/download/991/report.pdf
//! ```
//!
//! A file downloaded from an issue page therefore carries its ticket number
//! even when the file name doesn't.

use crate::consts::ISSUE_URL_REGEX;
use crate::models::TicketId;

/// Name of the alternate data stream, appended to a path as `file:Zone.Identifier`.
pub const ZONE_IDENTIFIER_STREAM: &str = "Zone.Identifier";

/// Extracts the issue number from the `ReferrerUrl` (preferred) or `HostUrl`
/// entries of a `Zone.Identifier` stream.
pub fn referrer_ticket(zone_identifier: &str) -> Option<TicketId> {
    let value = |key: &str| {
        zone_identifier.lines().find_map(|line| {
            let (k, v) = line.trim().split_once('=')?;
            k.trim().eq_ignore_ascii_case(key).then(|| v.trim())
        })
    };
    ["ReferrerUrl", "HostUrl"]
        .into_iter()
        .filter_map(value)
        .find_map(|url| ISSUE_URL_REGEX.captures(url)?.get(1)?.as_str().parse().ok())
}
