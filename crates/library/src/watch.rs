//! Turns filesystem notifications for the monitored directory into debounced
//! [`MonitoredEvent`]s.
//!
//! `notify` delivers on its own thread; the callback only forwards into a
//! channel and a single task owns the debounce state. Files that were already
//! present when watching started are left to scans.

use crate::error::{ErrorKind, Result};
use crate::event::{EventKind, MonitoredEvent};
use crate::filter::Filter;
use crate::scan::scan;
use docket_config::Settings;
use exn::{OptionExt, ResultExt};
use futures::StreamExt;
use notify::event::{ModifyKind, RenameMode};
use notify::{RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

/// How often the monitored directory itself is checked for existence.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub directory: PathBuf,
    pub recursive: bool,
    pub filter: Filter,
    pub debounce: Duration,
    pub health_check: Duration,
}

impl WatchConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            directory: settings.monitored_directory.clone(),
            recursive: settings.recursive,
            filter: Filter::from_settings(settings),
            debounce: settings.debounce(),
            health_check: HEALTH_CHECK_INTERVAL,
        }
    }
}

/// A path waiting out its debounce window.
#[derive(Debug, Clone, Copy)]
struct Pending {
    kind: EventKind,
    due: Instant,
}

/// Debounce bookkeeping, kept apart from the notify plumbing.
#[derive(Debug)]
struct Debouncer {
    window: Duration,
    filter: Filter,
    /// Files that existed when watching started.
    present: HashSet<PathBuf>,
    pending: HashMap<PathBuf, Pending>,
}

impl Debouncer {
    fn new(window: Duration, filter: Filter, present: HashSet<PathBuf>) -> Self {
        Self { window, filter, present, pending: HashMap::new() }
    }

    fn next_due(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.due).min()
    }

    fn touch(&mut self, path: PathBuf, kind: EventKind, now: Instant) {
        if !self.filter.accepts(&path) {
            trace!(path = %path.display(), "ignored by filter");
            return;
        }
        match kind {
            EventKind::Modified if self.present.contains(&path) && !self.pending.contains_key(&path) => {
                trace!(path = %path.display(), "modification of a pre-existing file");
                return;
            },
            EventKind::Modified => {},
            _ => {
                self.present.remove(&path);
            },
        }
        let due = now + self.window;
        self.pending
            .entry(path)
            .and_modify(|pending| {
                // A create or rename is more telling than the writes that follow it.
                if pending.kind == EventKind::Modified {
                    pending.kind = kind;
                }
                pending.due = due;
            })
            .or_insert(Pending { kind, due });
    }

    fn forget(&mut self, path: &Path) {
        self.present.remove(path);
        self.pending.remove(path);
    }

    fn apply(&mut self, event: notify::Event, now: Instant) {
        use notify::EventKind as Notify;
        let mut paths = event.paths.into_iter();
        match event.kind {
            Notify::Create(_) => paths.for_each(|path| self.touch(path, EventKind::Created, now)),
            Notify::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if let Some(from) = paths.next() {
                    self.forget(&from);
                }
                paths.for_each(|path| self.touch(path, EventKind::Renamed, now));
            },
            Notify::Modify(ModifyKind::Name(RenameMode::From)) => paths.for_each(|path| self.forget(&path)),
            Notify::Modify(ModifyKind::Name(_)) => paths.for_each(|path| self.touch(path, EventKind::Renamed, now)),
            Notify::Modify(_) => paths.for_each(|path| self.touch(path, EventKind::Modified, now)),
            Notify::Remove(_) => paths.for_each(|path| self.forget(&path)),
            Notify::Access(_) | Notify::Any | Notify::Other => {},
        }
    }

    /// Removes and returns every path whose window has passed, in path order.
    fn take_due(&mut self, now: Instant) -> Vec<MonitoredEvent> {
        let mut due: Vec<_> = self
            .pending
            .extract_if(|_, pending| pending.due <= now)
            .map(|(path, pending)| MonitoredEvent::new(path, pending.kind))
            .collect();
        due.sort_by(|a, b| a.path.cmp(&b.path));
        due
    }
}

async fn ensure_directory(directory: &Path) -> Result<()> {
    let metadata = tokio::fs::metadata(directory).await.or_raise(|| ErrorKind::WatcherFatal)?;
    if !metadata.is_dir() {
        exn::bail!(ErrorKind::WatcherFatal);
    }
    Ok(())
}

async fn snapshot(config: &WatchConfig) -> HashSet<PathBuf> {
    scan(config.directory.clone(), config.filter.clone(), config.recursive)
        .filter_map(|event| async move { event.ok().map(|event| event.path) })
        .collect()
        .await
}

/// Watches `config.directory` until `cancel` fires or `events` is closed,
/// both of which return `Ok`.
///
/// Any trouble with the watch itself (registration, a notify error, the
/// directory disappearing) ends the session with
/// [`ErrorKind::WatcherFatal`]. Nothing is retried here.
#[instrument(skip_all, fields(directory = %config.directory.display()))]
pub async fn run(config: WatchConfig, events: mpsc::Sender<MonitoredEvent>, cancel: CancellationToken) -> Result<()> {
    ensure_directory(&config.directory).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |result| {
        // The receiver only goes away once the session is over.
        let _ = tx.send(result);
    })
    .or_raise(|| ErrorKind::WatcherFatal)?;
    let mode = match config.recursive {
        true => RecursiveMode::Recursive,
        false => RecursiveMode::NonRecursive,
    };
    watcher.watch(&config.directory, mode).or_raise(|| ErrorKind::WatcherFatal)?;

    let mut debouncer = Debouncer::new(config.debounce, config.filter.clone(), snapshot(&config).await);
    debug!(present = debouncer.present.len(), "watching");

    let mut health = tokio::time::interval(config.health_check);
    health.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let next_due = debouncer.next_due();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(pending = debouncer.pending.len(), "watch cancelled");
                return Ok(());
            },
            message = rx.recv() => {
                let event = message.ok_or_raise(|| ErrorKind::WatcherFatal)?;
                let event = event.or_raise(|| ErrorKind::WatcherFatal)?;
                if event.kind.is_remove() && event.paths.iter().any(|path| path == &config.directory) {
                    warn!("monitored directory was removed");
                    exn::bail!(ErrorKind::WatcherFatal);
                }
                debouncer.apply(event, Instant::now());
            },
            _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                for event in debouncer.take_due(Instant::now()) {
                    debug!(path = %event.path.display(), kind = %event.kind, "emitting");
                    if events.send(event).await.is_err() {
                        return Ok(());
                    }
                }
            },
            _ = health.tick() => ensure_directory(&config.directory).await?,
        }
    }
}
