//! Commands understood by a running instance, and what they do.
//!
//! The wire format is a single line per request (`status`, `recent 20`, ...)
//! answered with free-form text; the connection is closed after the answer.

use crate::error::{Error, ErrorKind};
use derive_more::Display;
use docket_library::{MoveRecord, ScanSummary, Service, Status};
use std::fmt::Write;
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;

pub const DEFAULT_RECENT: usize = 20;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Scan right away and report the status.
    #[display("show")]
    Show,
    #[display("scan")]
    Scan,
    #[display("start")]
    Start,
    #[display("stop")]
    Stop,
    #[display("status")]
    Status,
    #[display("recent {_0}")]
    Recent(usize),
}

impl FromStr for Request {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let request = match (words.next(), words.next()) {
            (Some("show"), None) => Self::Show,
            (Some("scan"), None) => Self::Scan,
            (Some("start"), None) => Self::Start,
            (Some("stop"), None) => Self::Stop,
            (Some("status"), None) => Self::Status,
            (Some("recent"), None) => Self::Recent(DEFAULT_RECENT),
            (Some("recent"), Some(n)) => match n.parse() {
                Ok(n) => Self::Recent(n),
                Err(_) => exn::bail!(ErrorKind::Control),
            },
            _ => exn::bail!(ErrorKind::Control),
        };
        if words.next().is_some() {
            exn::bail!(ErrorKind::Control);
        }
        Ok(request)
    }
}

/// Something that can answer control requests.
pub trait Responder: Clone + Send + Sync + 'static {
    fn respond(&self, request: Request) -> impl Future<Output = String> + Send;
}

impl Responder for Service {
    async fn respond(&self, request: Request) -> String {
        execute(self, request).await
    }
}

/// Carries out `request` against `service` and renders the answer.
pub async fn execute(service: &Service, request: Request) -> String {
    match request {
        Request::Show => {
            drop(service.trigger_scan());
            format_status(&service.status())
        },
        Request::Scan => match service.trigger_scan().finished().await {
            Some(summary) => format_summary(&summary),
            None => "error: scan could not run; check the configuration\n".to_string(),
        },
        Request::Start => match service.start_watching().await {
            Ok(()) => format_status(&service.status()),
            Err(err) => format!("error: {}\n", *err),
        },
        Request::Stop => {
            service.stop_watching();
            format_status(&service.status())
        },
        Request::Status => format_status(&service.status()),
        Request::Recent(n) => match service.recent_entries(n).await {
            Ok(records) => format_records(&records),
            Err(err) => format!("error: {}\n", *err),
        },
    }
}

pub fn format_status(status: &Status) -> String {
    let mut out = format!("mode: {}\n", status.mode);
    if let Some(directory) = &status.monitored_directory {
        let _ = writeln!(out, "directory: {}", directory.display());
    }
    let _ = writeln!(out, "in flight: {}", status.in_flight);
    let _ = writeln!(out, "watcher restarts: {}", status.watcher_restarts);
    let _ = writeln!(out, "scanning: {}", if status.scanning { "yes" } else { "no" });
    out
}

pub fn format_summary(summary: &ScanSummary) -> String {
    format!(
        "scanned {} files: {} moved, {} skipped, {} failed\n",
        summary.discovered, summary.succeeded, summary.skipped, summary.failed
    )
}

pub fn format_records(records: &[MoveRecord]) -> String {
    if records.is_empty() {
        return "no entries\n".to_string();
    }
    let mut out = String::new();
    for record in records {
        let timestamp = record.timestamp.format(&Rfc3339).unwrap_or_else(|_| record.timestamp.to_string());
        let _ = write!(out, "{timestamp} {:<7} {}", record.outcome, record.source.display());
        if let Some(destination) = &record.destination {
            let _ = write!(out, " -> {}", destination.display());
        }
        let _ = writeln!(out, " ({})", record.reason);
    }
    out
}
