//! In-memory resolver for testing.

use crate::TicketResolver;
use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use docket_extract::models::{TicketId, TicketMetadata};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// In-memory [`TicketResolver`] for testing.
///
/// Known tickets resolve to their metadata, configured failures resolve to
/// their error, everything else is [`ErrorKind::NotFound`]. An optional
/// artificial latency lets tests hold a resolution "in flight", and every
/// call is counted.
///
/// # Examples
///
/// ```
/// use docket_redmine::{MockResolver, TicketResolver};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let resolver = MockResolver::with_tickets([("4521", "Acme", "Invoices", "Q4 invoices")]);
/// let id = "4521".parse().unwrap();
/// let metadata = resolver.resolve(&id, Duration::from_secs(1)).await.unwrap();
/// assert_eq!(metadata.project, "Acme");
/// assert_eq!(resolver.calls(), 1);
/// # }
/// ```
#[derive(Default)]
pub struct MockResolver {
    tickets: RwLock<HashMap<TicketId, std::result::Result<TicketMetadata, ErrorKind>>>,
    latency: Option<Duration>,
    calls: AtomicUsize,
}

impl MockResolver {
    /// Panics on identifiers that aren't digits. If test setup is wrong,
    /// then test should not pass.
    pub fn with_tickets<'a>(tickets: impl IntoIterator<Item = (&'a str, &'a str, &'a str, &'a str)>) -> Self {
        let map = tickets
            .into_iter()
            .map(|(id, project, category, title)| {
                let Ok(id) = id.parse::<TicketId>() else {
                    panic!("MockResolver::with_tickets: invalid ticket id {id:?}");
                };
                (id.clone(), Ok(TicketMetadata::new(id, project, category, title)))
            })
            .collect();
        Self { tickets: RwLock::new(map), ..Self::default() }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub async fn fail(&self, id: &str, kind: ErrorKind) {
        let Ok(id) = id.parse::<TicketId>() else {
            panic!("MockResolver::fail: invalid ticket id {id:?}");
        };
        self.tickets.write().await.insert(id, Err(kind));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TicketResolver for MockResolver {
    async fn resolve(&self, id: &TicketId, timeout: Duration) -> Result<TicketMetadata> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            if latency >= timeout {
                tokio::time::sleep(timeout).await;
                exn::bail!(ErrorKind::Timeout);
            }
            tokio::time::sleep(latency).await;
        }
        match self.tickets.read().await.get(id) {
            Some(Ok(metadata)) => Ok(metadata.clone()),
            Some(Err(kind)) => exn::bail!(*kind),
            None => exn::bail!(ErrorKind::NotFound),
        }
    }
}
