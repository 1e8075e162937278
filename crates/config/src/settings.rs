//! The settings model.

use crate::error::{ErrorKind, Result};
use directories::{BaseDirs, UserDirs};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_LAYOUT: &str = "{{ project }}/{{ category }}/{{ ticket }}/{{ date }}";
pub const DEFAULT_TICKET_PATTERN: &str = r"(?i)ticket-([0-9]+)";
pub const DEFAULT_JOURNAL_FILE: &str = "docket-moves.log";
/// Resolution retries are a courtesy to flaky networks, not a way to hammer
/// an unreachable server.
pub const MAX_RESOLVE_RETRIES: u32 = 3;

/// An API credential that refuses to print itself.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);
impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.is_empty() {
            true => f.write_str("Secret(<empty>)"),
            false => f.write_str("Secret(****)"),
        }
    }
}

/// How a freshly-announced file is judged to be "done" being written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stability {
    /// Delay between two size/mtime samples.
    pub interval_ms: u64,
    /// Samples taken before giving up on a file that keeps changing.
    pub attempts: u32,
}
impl Default for Stability {
    fn default() -> Self {
        Self { interval_ms: 500, attempts: 10 }
    }
}
impl Stability {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Everything the organizer needs to know, loaded fresh for every invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub monitored_directory: PathBuf,
    pub organizing_root: PathBuf,
    pub api_base_url: String,
    pub api_token: Secret,
    pub notifications_enabled: bool,
    pub open_folder_on_move: bool,
    pub recursive: bool,
    pub layout: String,
    pub ticket_pattern: String,
    pub use_zone_identifier: bool,
    pub ignored_suffixes: Vec<String>,
    pub request_timeout_secs: u64,
    pub resolve_retries: u32,
    pub cache_resolutions: bool,
    pub debounce_ms: u64,
    pub stability: Stability,
    pub move_retries: u32,
    pub move_backoff_ms: u64,
    pub scan_concurrency: usize,
    pub scan_on_start: bool,
    pub scan_interval_secs: Option<u64>,
    pub max_watcher_restarts: u32,
    pub journal_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            monitored_directory: default_monitored_directory().unwrap_or_default(),
            organizing_root: PathBuf::new(),
            api_base_url: String::new(),
            api_token: Secret::default(),
            notifications_enabled: true,
            open_folder_on_move: false,
            recursive: false,
            layout: DEFAULT_LAYOUT.to_string(),
            ticket_pattern: DEFAULT_TICKET_PATTERN.to_string(),
            use_zone_identifier: true,
            ignored_suffixes: [".tmp", ".crdownload", ".partial", ".download", ".part"]
                .into_iter()
                .map(String::from)
                .collect(),
            request_timeout_secs: 5,
            resolve_retries: 0,
            cache_resolutions: false,
            debounce_ms: 1000,
            stability: Stability::default(),
            move_retries: 3,
            move_backoff_ms: 250,
            scan_concurrency: 4,
            scan_on_start: false,
            scan_interval_secs: None,
            max_watcher_restarts: 3,
            journal_path: None,
        }
    }
}

impl Settings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn move_backoff(&self) -> Duration {
        Duration::from_millis(self.move_backoff_ms)
    }

    pub fn scan_interval(&self) -> Option<Duration> {
        self.scan_interval_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }

    /// Location of the move journal: the configured override, or a fixed file
    /// in the user's home directory.
    pub fn journal_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.journal_path {
            return Ok(path.clone());
        }
        let base = BaseDirs::new().ok_or(ErrorKind::NoHomeDirectory)?;
        Ok(base.home_dir().join(DEFAULT_JOURNAL_FILE))
    }

    /// Reject settings that would make the organizer misbehave rather than
    /// fail loudly later on.
    pub fn validate(&self) -> Result<()> {
        require_absolute("monitored_directory", &self.monitored_directory)?;
        require_absolute("organizing_root", &self.organizing_root)?;
        if self.recursive && self.organizing_root.starts_with(&self.monitored_directory) {
            exn::bail!(ErrorKind::invalid(
                "organizing_root",
                "must not live inside a recursively monitored directory"
            ));
        }
        let url = self.api_base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            exn::bail!(ErrorKind::invalid("api_base_url", "must be an http(s) URL"));
        }
        if self.api_token.is_empty() {
            exn::bail!(ErrorKind::invalid("api_token", "must not be empty"));
        }
        if self.layout.trim().is_empty() {
            exn::bail!(ErrorKind::invalid("layout", "must not be empty"));
        }
        if self.ticket_pattern.trim().is_empty() {
            exn::bail!(ErrorKind::invalid("ticket_pattern", "must not be empty"));
        }
        match Regex::new(&self.ticket_pattern) {
            // The implicit whole-match group counts too.
            Ok(pattern) if pattern.captures_len() == 2 => {},
            Ok(pattern) => exn::bail!(ErrorKind::invalid(
                "ticket_pattern",
                format!("needs exactly one capture group for the ticket digits, found {}", pattern.captures_len() - 1)
            )),
            Err(err) => exn::bail!(ErrorKind::invalid("ticket_pattern", err.to_string())),
        }
        if self.request_timeout_secs == 0 {
            exn::bail!(ErrorKind::invalid("request_timeout_secs", "must be at least 1"));
        }
        if self.resolve_retries > MAX_RESOLVE_RETRIES {
            exn::bail!(ErrorKind::invalid(
                "resolve_retries",
                format!("must be at most {MAX_RESOLVE_RETRIES}")
            ));
        }
        if self.scan_concurrency == 0 {
            exn::bail!(ErrorKind::invalid("scan_concurrency", "must be at least 1"));
        }
        if self.stability.attempts == 0 {
            exn::bail!(ErrorKind::invalid("stability.attempts", "must be at least 1"));
        }
        Ok(())
    }
}

fn require_absolute(field: &'static str, path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        exn::bail!(ErrorKind::invalid(field, "must be set"));
    }
    if !path.is_absolute() {
        exn::bail!(ErrorKind::invalid(field, format!("`{}` is not an absolute path", path.display())));
    }
    Ok(())
}

fn default_monitored_directory() -> Option<PathBuf> {
    let dirs = UserDirs::new()?;
    Some(dirs.download_dir().map(Path::to_path_buf).unwrap_or_else(|| dirs.home_dir().join("Downloads")))
}
