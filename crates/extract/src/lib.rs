//! Ticket identifiers and ticket metadata.
//!
//! - [`Extractor`] finds a [`TicketId`](models::TicketId) in a file name.
//! - [`referrer_ticket`] finds one in a Windows `Zone.Identifier` stream.
//! - [`models::TicketMetadata`] is what a resolver returns for an identifier.
//!
//! A file without an identifier is a perfectly normal download that simply
//! isn't ours to organize, so extraction returns [`Option`], not [`Result`].

mod consts;
pub mod error;
mod extractor;
pub mod models;
mod zone;

pub use crate::extractor::Extractor;
pub use crate::zone::{ZONE_IDENTIFIER_STREAM, referrer_ticket};

/// Default pattern: `TICKET-` (any case) followed by the ticket digits.
pub const DEFAULT_PATTERN: &str = r"(?i)ticket-([0-9]+)";

/// Extracts a ticket identifier from `file_name` using [`DEFAULT_PATTERN`].
pub fn extract(file_name: &str) -> Option<models::TicketId> {
    Extractor::default().extract(file_name)
}
