use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::UtcDateTime;

/// What made us look at a path.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    #[display("created")]
    Created,
    #[display("modified")]
    Modified,
    #[display("renamed")]
    Renamed,
    /// Found by walking the directory rather than by a notification.
    #[display("scanned")]
    Scanned,
}

/// A candidate file, as reported by the watcher or a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredEvent {
    pub path: PathBuf,
    pub kind: EventKind,
    pub observed_at: UtcDateTime,
}

impl MonitoredEvent {
    pub fn new(path: impl Into<PathBuf>, kind: EventKind) -> Self {
        Self { path: path.into(), kind, observed_at: UtcDateTime::now() }
    }

    pub fn file_name(&self) -> Option<String> {
        self.path.file_name().map(|n| n.to_string_lossy().into_owned())
    }
}
