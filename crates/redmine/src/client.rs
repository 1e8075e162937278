//! Redmine REST API client.

use crate::TicketResolver;
use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use docket_extract::models::{TicketId, TicketMetadata};
use exn::{OptionExt, ResultExt};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::instrument;

/// Header Redmine reads the REST API key from.
pub const API_KEY_HEADER: &str = "X-Redmine-API-Key";

#[derive(Deserialize)]
struct IssueEnvelope {
    issue: Issue,
}

#[derive(Deserialize)]
struct Issue {
    subject: Option<String>,
    project: Option<Named>,
    category: Option<Named>,
    tracker: Option<Named>,
}

#[derive(Deserialize)]
struct Named {
    name: String,
}

fn non_empty(named: Option<Named>) -> Option<String> {
    named.map(|n| n.name.trim().to_string()).filter(|n| !n.is_empty())
}

/// Resolves tickets against `GET {base}/issues/{id}.json`.
///
/// The [`Client`] is cheap to clone and pools connections, so a long-running
/// process should build one and share it; the base URL and key are plain
/// values so the caller can rebuild a `RedmineClient` from fresh settings
/// whenever it likes.
#[derive(Clone)]
pub struct RedmineClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl std::fmt::Debug for RedmineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedmineClient").field("base_url", &self.base_url).finish_non_exhaustive()
    }
}

impl RedmineClient {
    pub fn new(http: Client, base_url: impl AsRef<str>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.as_ref().trim().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// A [`Client`] suitable for sharing between [`RedmineClient`]s.
    pub fn http_client() -> Result<Client> {
        Client::builder()
            .user_agent(concat!("docket/", env!("CARGO_PKG_VERSION")))
            .build()
            .or_raise(|| ErrorKind::Unreachable)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn issue_url(&self, id: &TicketId) -> String {
        format!("{}/issues/{}.json", self.base_url, id)
    }

    async fn fetch(&self, id: &TicketId, timeout: Duration) -> Result<TicketMetadata> {
        let response = match self
            .http
            .get(self.issue_url(id))
            .header(API_KEY_HEADER, &self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let kind = ErrorKind::from_reqwest(&e);
                return Err(e).or_raise(|| kind);
            },
        };

        let status = response.status();
        if !status.is_success() {
            exn::bail!(ErrorKind::from_status(status.as_u16()));
        }
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                let kind = ErrorKind::from_reqwest(&e);
                return Err(e).or_raise(|| kind);
            },
        };
        let IssueEnvelope { issue } = serde_json::from_slice(&body).or_raise(|| ErrorKind::Malformed)?;

        let project = non_empty(issue.project).ok_or_raise(|| ErrorKind::Malformed)?;
        // Plenty of Redmine projects never set up issue categories; the
        // tracker ("Bug", "Support", ...) is the next best grouping.
        let category = non_empty(issue.category).or_else(|| non_empty(issue.tracker)).ok_or_raise(|| ErrorKind::Malformed)?;
        let title = issue.subject.ok_or_raise(|| ErrorKind::Malformed)?;
        Ok(TicketMetadata::new(id.clone(), project, category, title))
    }
}

#[async_trait]
impl TicketResolver for RedmineClient {
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn resolve(&self, id: &TicketId, timeout: Duration) -> Result<TicketMetadata> {
        if self.api_key.trim().is_empty() {
            exn::bail!(ErrorKind::Unauthorized);
        }
        // reqwest's own timeout should fire first; this one also covers
        // anything reqwest doesn't count (slow DNS, a body that trickles in).
        match tokio::time::timeout(timeout, self.fetch(id, timeout)).await {
            Ok(result) => result,
            Err(_elapsed) => exn::bail!(ErrorKind::Timeout),
        }
    }
}
