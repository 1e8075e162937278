//! The long-running organizer.
//!
//! A [`Service`] owns one [`Pipeline`], the watcher supervisor and the scan
//! coordinator. Every worker it starts is spawned on a single
//! [`TaskTracker`], so [`Service::shutdown`] can wait for files that are
//! halfway through being moved.

use crate::error::{ErrorKind, Result};
use crate::event::MonitoredEvent;
use crate::journal::{Journal, MoveRecord};
use crate::pipeline::{Notifier, Pipeline, ResolverFactory};
use crate::scan::{ScanCoordinator, ScanHandle};
use crate::watch::{self, WatchConfig};
use derive_more::Display;
use docket_config::{Settings, SettingsSource};
use exn::ResultExt;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use time::UtcOffset;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// Linear backoff step between watcher restarts.
const RESTART_BACKOFF: Duration = Duration::from_secs(1);
/// A session that lasted this long resets the consecutive failure count.
const HEALTHY_SESSION: Duration = Duration::from_secs(60);
/// Scan cadence once watching has been given up, unless configured.
const DEGRADED_SCAN_INTERVAL: Duration = Duration::from_secs(60);
const WATCH_QUEUE: usize = 64;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    #[display("stopped")]
    Stopped,
    #[display("watching")]
    Watching,
    /// The watcher failed too often; only periodic scans are running.
    #[display("scan-only")]
    ScanOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub mode: Mode,
    pub monitored_directory: Option<PathBuf>,
    pub in_flight: usize,
    /// Consecutive watcher failures in the current session.
    pub watcher_restarts: u32,
    pub scanning: bool,
}

#[derive(Debug)]
struct State {
    mode: Mode,
    directory: Option<PathBuf>,
    restarts: u32,
    session: Option<CancellationToken>,
}

struct Inner {
    pipeline: Arc<Pipeline>,
    scans: ScanCoordinator,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    state: Mutex<State>,
}

/// Cheap to clone; clones control the same organizer.
#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

impl Service {
    /// The journal location is taken from the settings as they are now and
    /// stays fixed for the lifetime of the service.
    pub fn new(
        source: Arc<dyn SettingsSource>,
        resolvers: Arc<dyn ResolverFactory>,
        notifier: Arc<dyn Notifier>,
        offset: UtcOffset,
    ) -> Result<Self> {
        let settings = source.load().or_raise(|| ErrorKind::Settings)?;
        let journal = Journal::new(settings.journal_path().or_raise(|| ErrorKind::Settings)?);
        debug!(journal = %journal.path().display(), "journal location");
        let pipeline = Arc::new(Pipeline::new(source, resolvers, notifier, Arc::new(journal), offset));
        pipeline.check(&settings)?;
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let scans = ScanCoordinator::new(Arc::clone(&pipeline), tracker.clone(), shutdown.clone());
        let state = State { mode: Mode::Stopped, directory: None, restarts: 0, session: None };
        Ok(Self { inner: Arc::new(Inner { pipeline, scans, tracker, shutdown, state: Mutex::new(state) }) })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts (or restarts, picking up new settings) watching the monitored
    /// directory.
    #[instrument(skip(self))]
    pub async fn start_watching(&self) -> Result<()> {
        let settings = self.inner.pipeline.settings()?;
        self.inner.pipeline.check(&settings)?;
        let session = self.inner.shutdown.child_token();
        {
            let mut state = self.state();
            if let Some(previous) = state.session.replace(session.clone()) {
                previous.cancel();
            }
            state.mode = Mode::Watching;
            state.directory = Some(settings.monitored_directory.clone());
            state.restarts = 0;
        }
        info!(directory = %settings.monitored_directory.display(), "watching");

        let service = self.clone();
        let supervised = session.clone();
        self.inner.tracker.spawn(async move { service.supervise(supervised).await });
        if let Some(every) = settings.scan_interval() {
            let service = self.clone();
            let scheduled = session.clone();
            self.inner.tracker.spawn(async move { service.scan_periodically(every, Instant::now() + every, scheduled).await });
        }
        if settings.scan_on_start {
            drop(self.inner.scans.trigger());
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn stop_watching(&self) {
        let mut state = self.state();
        if let Some(session) = state.session.take() {
            session.cancel();
            info!("stopped watching");
        }
        state.mode = Mode::Stopped;
        state.directory = None;
        state.restarts = 0;
    }

    /// Walks the monitored directory once, cancelling any scan in progress.
    pub fn trigger_scan(&self) -> ScanHandle {
        self.inner.scans.trigger()
    }

    pub async fn recent_entries(&self, n: usize) -> Result<Vec<MoveRecord>> {
        self.inner.pipeline.journal().recent(n).await
    }

    pub fn journal_path(&self) -> PathBuf {
        self.inner.pipeline.journal().path().to_path_buf()
    }

    pub fn status(&self) -> Status {
        let state = self.state();
        Status {
            mode: state.mode,
            monitored_directory: state.directory.clone(),
            in_flight: self.inner.pipeline.in_flight().len(),
            watcher_restarts: state.restarts,
            scanning: self.inner.scans.is_running(),
        }
    }

    /// Stops watching and scanning, then waits for every started file to be
    /// finished and journaled.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.stop_watching();
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("shut down");
    }

    /// Runs `f` on the state unless `session` has been superseded.
    fn update(&self, session: &CancellationToken, f: impl FnOnce(&mut State)) -> bool {
        let mut state = self.state();
        if session.is_cancelled() {
            return false;
        }
        f(&mut state);
        true
    }

    async fn supervise(self, session: CancellationToken) {
        let mut failures = 0u32;
        loop {
            let settings = self.inner.pipeline.settings();
            let max_restarts = settings.as_ref().map_or(Settings::default().max_watcher_restarts, |s| s.max_watcher_restarts);
            let started = Instant::now();
            let result = match settings {
                Ok(settings) => self.watch_session(WatchConfig::from_settings(&settings), &session).await,
                Err(err) => Err(err),
            };
            let Err(err) = result else {
                return;
            };
            if session.is_cancelled() {
                return;
            }
            if started.elapsed() >= HEALTHY_SESSION {
                failures = 0;
            }
            if failures >= max_restarts {
                self.degrade(session, failures).await;
                return;
            }
            failures += 1;
            if !self.update(&session, |state| state.restarts = failures) {
                return;
            }
            error!(error = ?err, attempt = failures, max_restarts, "watcher failed; restarting");
            tokio::select! {
                _ = session.cancelled() => return,
                _ = tokio::time::sleep(RESTART_BACKOFF * failures) => {},
            }
        }
    }

    /// One watcher run, with every emitted path handed to its own worker.
    async fn watch_session(&self, config: WatchConfig, session: &CancellationToken) -> Result<()> {
        let (tx, rx) = mpsc::channel(WATCH_QUEUE);
        let watcher = watch::run(config, tx, session.child_token());
        let (result, ()) = tokio::join!(watcher, self.dispatch(rx, session));
        result
    }

    /// Starts a worker per queued event until the queue closes or the
    /// session ends; whatever is still queued then is dropped.
    async fn dispatch(&self, mut rx: mpsc::Receiver<MonitoredEvent>, session: &CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                _ = session.cancelled() => break,
                event = rx.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            if session.is_cancelled() {
                break;
            }
            let pipeline = Arc::clone(&self.inner.pipeline);
            self.inner.tracker.spawn(async move { pipeline.handle(event, None).await });
        }
        if !rx.is_empty() {
            debug!(dropped = rx.len(), "session ended with events still queued");
        }
    }

    async fn degrade(&self, session: CancellationToken, restarts: u32) {
        let every = match self.inner.pipeline.settings() {
            Ok(settings) => settings.scan_interval().unwrap_or(DEGRADED_SCAN_INTERVAL),
            Err(_) => DEGRADED_SCAN_INTERVAL,
        };
        if !self.update(&session, |state| state.mode = Mode::ScanOnly) {
            return;
        }
        let message =
            format!("Watching the downloads folder failed {restarts} times in a row; scanning every {}s instead.", every.as_secs());
        warn!(restarts, interval_secs = every.as_secs(), "giving up on the watcher; falling back to periodic scans");
        self.inner.pipeline.notifier().warning(&message);
        self.scan_periodically(every, Instant::now(), session).await;
    }

    async fn scan_periodically(&self, every: Duration, first: Instant, session: CancellationToken) {
        let mut ticker = tokio::time::interval_at(first, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = session.cancelled() => return,
                _ = ticker.tick() => {},
            }
            debug!("periodic scan");
            let scan = self.inner.scans.trigger();
            let scan_cancel = scan.cancel.clone();
            tokio::select! {
                _ = session.cancelled() => {
                    scan_cancel.cancel();
                    return;
                },
                _ = scan.finished() => {},
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::journal::Outcome;
    use crate::pipeline::Quiet;
    use crate::pipeline::testing::Fixture;
    use docket_redmine::MockResolver;

    #[derive(Default)]
    struct Warnings(Mutex<Vec<String>>);

    impl Notifier for Warnings {
        fn warning(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    fn service(fixture: &Fixture, notifier: Arc<dyn Notifier>) -> Service {
        Service::new(Arc::new(fixture.settings.clone()), fixture.resolvers(), notifier, UtcOffset::UTC).unwrap()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn records(service: &Service, count: usize) -> Vec<MoveRecord> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let records = service.recent_entries(10).await.unwrap();
            if records.len() >= count {
                return records;
            }
            assert!(Instant::now() < deadline, "expected {count} records, got {records:?}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_invalid_settings_are_rejected() {
        let mut fixture = Fixture::new(MockResolver::default());
        fixture.settings.api_token = docket_config::Secret::default();
        let result = Service::new(Arc::new(fixture.settings.clone()), fixture.resolvers(), Arc::new(Quiet), UtcOffset::UTC);
        assert_eq!(*result.err().unwrap(), ErrorKind::Settings);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_and_stop() {
        let fixture = Fixture::new(MockResolver::default());
        let service = service(&fixture, Arc::new(Quiet));
        assert_eq!(service.status().mode, Mode::Stopped);

        service.start_watching().await.unwrap();
        let status = service.status();
        assert_eq!(status.mode, Mode::Watching);
        assert_eq!(status.monitored_directory.as_deref(), Some(fixture.downloads.as_path()));

        service.stop_watching();
        assert_eq!(service.status().mode, Mode::Stopped);
        service.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watched_download_is_filed() {
        let fixture = Fixture::new(MockResolver::with_tickets([("4521", "Acme", "Invoices", "t")]));
        let service = service(&fixture, Arc::new(Quiet));
        service.start_watching().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        fixture.download("invoice_TICKET-4521.pdf", "%PDF");

        let records = records(&service, 1).await;
        assert_eq!(records[0].outcome, Outcome::Success);
        assert!(fixture.root.join("Acme/Invoices/4521/20241217/invoice_TICKET-4521.pdf").exists());
        service.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scan_on_start_picks_up_existing_files() {
        let mut fixture = Fixture::new(MockResolver::default());
        fixture.settings.scan_on_start = true;
        fixture.download("holiday.jpg", "jpeg");
        let service = service(&fixture, Arc::new(Quiet));

        service.start_watching().await.unwrap();

        let records = records(&service, 1).await;
        assert_eq!(records[0].outcome, Outcome::Skipped);
        service.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unwatchable_directory_degrades_to_scans() {
        let mut fixture = Fixture::new(MockResolver::default());
        fixture.settings.monitored_directory = fixture.temp.path().join("gone");
        fixture.settings.max_watcher_restarts = 1;
        let warnings = Arc::new(Warnings::default());
        let service = service(&fixture, Arc::clone(&warnings) as Arc<dyn Notifier>);

        service.start_watching().await.unwrap();
        wait_for(|| !warnings.0.lock().unwrap().is_empty()).await;

        let status = service.status();
        assert_eq!(status.mode, Mode::ScanOnly);
        assert_eq!(status.watcher_restarts, 1);
        assert_eq!(warnings.0.lock().unwrap().len(), 1);
        service.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_prevents_degrading() {
        let mut fixture = Fixture::new(MockResolver::default());
        fixture.settings.monitored_directory = fixture.temp.path().join("gone");
        fixture.settings.max_watcher_restarts = 3;
        let warnings = Arc::new(Warnings::default());
        let service = service(&fixture, Arc::clone(&warnings) as Arc<dyn Notifier>);

        service.start_watching().await.unwrap();
        service.stop_watching();
        service.shutdown().await;

        assert_eq!(service.status().mode, Mode::Stopped);
        assert!(warnings.0.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_waits_for_workers() {
        let fixture = Fixture::new(
            MockResolver::with_tickets([("4521", "Acme", "Invoices", "t")]).with_latency(Duration::from_millis(300)),
        );
        fixture.download("invoice_TICKET-4521.pdf", "%PDF");
        let service = service(&fixture, Arc::new(Quiet));

        let _scan = service.trigger_scan();
        wait_for(|| service.status().in_flight == 1).await;
        service.shutdown().await;

        assert_eq!(service.status().in_flight, 0);
        assert_eq!(service.recent_entries(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_queued_events_are_dropped_once_the_session_ends() {
        let fixture = Fixture::new(MockResolver::with_tickets([("4521", "Acme", "Invoices", "[Q4] Invoice run")]));
        let service = service(&fixture, Arc::new(Quiet));
        let (tx, rx) = mpsc::channel(WATCH_QUEUE);
        let mut sources = Vec::new();
        for n in 0..WATCH_QUEUE {
            let source = fixture.download(&format!("invoice_{n}_TICKET-4521.pdf"), "%PDF");
            tx.send(MonitoredEvent::new(&source, EventKind::Created)).await.unwrap();
            sources.push(source);
        }

        let session = CancellationToken::new();
        session.cancel();
        service.dispatch(rx, &session).await;

        assert!(service.inner.tracker.is_empty());
        service.shutdown().await;
        assert!(sources.iter().all(|source| source.exists()));
        assert!(!fixture.root.exists());
        assert!(service.recent_entries(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_uncompilable_layout_is_rejected_up_front() {
        let mut fixture = Fixture::new(MockResolver::default());
        fixture.settings.layout = "{{ project".to_string();
        let result = Service::new(Arc::new(fixture.settings.clone()), fixture.resolvers(), Arc::new(Quiet), UtcOffset::UTC);
        assert_eq!(*result.err().unwrap(), ErrorKind::Template);
    }
}
