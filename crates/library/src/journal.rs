//! The append-only move journal.
//!
//! One JSON object per line. The file is only ever appended to; nothing here
//! rewrites or truncates it.

use crate::error::{ErrorKind, Result};
use crate::event::{EventKind, MonitoredEvent};
use derive_more::Display;
use docket_extract::models::TicketId;
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind as IoErrorKind;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{error, instrument};

/// How much of the journal [`Journal::recent`] reads per step.
const TAIL_CHUNK: u64 = 8 * 1024;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    #[display("success")]
    Success,
    #[display("skipped")]
    Skipped,
    #[display("failed")]
    Failed,
}

/// One processed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub outcome: Outcome,
    pub trigger: EventKind,
    pub source: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<TicketId>,
    pub reason: String,
}

impl MoveRecord {
    fn new(event: &MonitoredEvent, outcome: Outcome, reason: impl Into<String>) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            outcome,
            trigger: event.kind,
            source: event.path.clone(),
            destination: None,
            ticket: None,
            reason: reason.into(),
        }
    }

    pub fn success(event: &MonitoredEvent, ticket: TicketId, destination: PathBuf, reason: impl Into<String>) -> Self {
        Self { ticket: Some(ticket), destination: Some(destination), ..Self::new(event, Outcome::Success, reason) }
    }

    pub fn skipped(event: &MonitoredEvent, reason: impl Into<String>) -> Self {
        Self::new(event, Outcome::Skipped, reason)
    }

    pub fn failed(event: &MonitoredEvent, ticket: Option<TicketId>, reason: impl Into<String>) -> Self {
        Self { ticket, ..Self::new(event, Outcome::Failed, reason) }
    }
}

/// Serializes appends to a single journal file.
///
/// The file handle is opened lazily and re-opened after a failed write, so a
/// journal on a briefly unavailable drive recovers by itself.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), file: Mutex::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `record` as a single line.
    ///
    /// On failure the whole record is emitted through `tracing` at error level
    /// before the error is returned, so it is never lost without a trace.
    #[instrument(level = "debug", skip_all, fields(source = %record.source.display(), outcome = %record.outcome))]
    pub async fn append(&self, record: &MoveRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).or_raise(|| ErrorKind::Journal)?;
        line.push('\n');

        let mut file = self.file.lock().await;
        let result = self.write_line(&mut file, line.as_bytes()).await;
        if let Err(err) = &result {
            // Drop the handle; the next append opens the file again.
            *file = None;
            error!(journal = %self.path.display(), record = line.trim_end(), error = ?err, "could not append to journal");
        }
        result
    }

    async fn write_line(&self, file: &mut Option<File>, line: &[u8]) -> Result<()> {
        if file.is_none() {
            if let Some(parent) = self.path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent).await.or_raise(|| ErrorKind::Journal)?;
            }
            let opened = OpenOptions::new().create(true).append(true).open(&self.path).await;
            *file = Some(opened.or_raise(|| ErrorKind::Journal)?);
        }
        let Some(handle) = file.as_mut() else {
            exn::bail!(ErrorKind::Journal);
        };
        // A single write on an append-mode handle; the flush waits for tokio's
        // background write to land.
        handle.write_all(line).await.or_raise(|| ErrorKind::Journal)?;
        handle.flush().await.or_raise(|| ErrorKind::Journal)
    }

    /// The last `n` readable records, oldest first. Lines that don't parse
    /// (hand edits, a torn line from a crash) are skipped.
    ///
    /// Reads backwards from the end of the file, so only the tail is touched
    /// however long the journal has grown.
    #[instrument(level = "debug", skip(self))]
    pub async fn recent(&self, n: usize) -> Result<Vec<MoveRecord>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        // Hold the lock so we never read a line that is half written.
        let _guard = self.file.lock().await;
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).or_raise(|| ErrorKind::Journal),
        };
        let mut end = file.metadata().await.or_raise(|| ErrorKind::Journal)?.len();
        // Bytes read so far that don't yet start at a line boundary.
        let mut pending: Vec<u8> = Vec::new();
        let mut records = Vec::with_capacity(n);
        while records.len() < n && end > 0 {
            let start = end.saturating_sub(TAIL_CHUNK);
            let mut chunk = vec![0; usize::try_from(end - start).or_raise(|| ErrorKind::Journal)?];
            file.seek(SeekFrom::Start(start)).await.or_raise(|| ErrorKind::Journal)?;
            file.read_exact(&mut chunk).await.or_raise(|| ErrorKind::Journal)?;
            chunk.append(&mut pending);
            end = start;

            // Everything after the first newline is made of whole lines; the
            // head may continue further back.
            let boundary = match start {
                0 => 0,
                _ => match chunk.iter().position(|&b| b == b'\n') {
                    Some(newline) => newline + 1,
                    None => {
                        pending = chunk;
                        continue;
                    },
                },
            };
            let lines = chunk.split_off(boundary);
            pending = chunk;
            let parsed = lines.split(|&b| b == b'\n').rev().filter_map(|line| serde_json::from_slice(line).ok());
            records.extend(parsed.take(n - records.len()));
        }
        records.reverse();
        Ok(records)
    }
}
