//! Ticket resolution against a Redmine server.
//!
//! The [`TicketResolver`] trait is the seam the organizer depends on;
//! [`RedmineClient`] is the real implementation. Resolvers make exactly one
//! attempt per call and never retry by themselves: whether (and how often) to
//! try again is the caller's decision.

mod client;
pub mod error;
#[cfg(feature = "mock")]
mod mock;

pub use crate::client::{API_KEY_HEADER, RedmineClient};
#[cfg(feature = "mock")]
pub use crate::mock::MockResolver;
use crate::error::Result;
use async_trait::async_trait;
use docket_extract::models::{TicketId, TicketMetadata};
use std::sync::Arc;
use std::time::Duration;

/// Turns a [`TicketId`] into [`TicketMetadata`].
///
/// Implementations must return within roughly `timeout`, answering
/// [`Timeout`](error::ErrorKind::Timeout) rather than hanging.
#[async_trait]
pub trait TicketResolver: Send + Sync {
    async fn resolve(&self, id: &TicketId, timeout: Duration) -> Result<TicketMetadata>;
}

pub type ResolverHandle = Arc<dyn TicketResolver>;
