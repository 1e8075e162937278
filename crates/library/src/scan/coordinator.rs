use crate::pipeline::Pipeline;
use crate::scan::{ScanEvent, ScanSummary, organize};
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

/// Runs scans on their own tasks, one at a time: triggering a scan cancels
/// whichever scan was running before.
pub struct ScanCoordinator {
    pipeline: Arc<Pipeline>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    current: Mutex<Option<CancellationToken>>,
    running: Arc<AtomicUsize>,
}

/// A triggered scan.
#[derive(Debug)]
pub struct ScanHandle {
    pub(crate) cancel: CancellationToken,
    task: JoinHandle<Option<ScanSummary>>,
}

impl ScanHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the scan to end. `None` if it couldn't run at all (usually
    /// unloadable settings; the reason has been logged).
    pub async fn finished(self) -> Option<ScanSummary> {
        self.task.await.ok().flatten()
    }
}

struct Running(Arc<AtomicUsize>);

impl Running {
    fn start(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScanCoordinator {
    /// Scans are spawned on `tracker` and stop when `shutdown` is cancelled.
    pub fn new(pipeline: Arc<Pipeline>, tracker: TaskTracker, shutdown: CancellationToken) -> Self {
        Self { pipeline, tracker, shutdown, current: Mutex::new(None), running: Arc::default() }
    }

    #[instrument(skip(self))]
    pub fn trigger(&self) -> ScanHandle {
        let cancel = self.shutdown.child_token();
        if let Some(previous) = self.current.lock().unwrap_or_else(PoisonError::into_inner).replace(cancel.clone()) {
            debug!("cancelling previous scan");
            previous.cancel();
        }
        let pipeline = Arc::clone(&self.pipeline);
        let running = Running::start(&self.running);
        let token = cancel.clone();
        let task = self.tracker.spawn(async move {
            let _running = running;
            let mut summary = None;
            let mut events = std::pin::pin!(organize(&pipeline, token));
            while let Some(event) = events.next().await {
                match event {
                    Ok(ScanEvent::Started) => info!("scan started"),
                    Ok(ScanEvent::Discovered(path)) => debug!(path = %path.display(), "discovered"),
                    Ok(ScanEvent::Processed(record)) => {
                        debug!(source = %record.source.display(), outcome = %record.outcome, "processed")
                    },
                    Ok(ScanEvent::Complete(s)) => {
                        info!(discovered = s.discovered, succeeded = s.succeeded, failed = s.failed, "scan complete");
                        summary = Some(s);
                    },
                    Ok(ScanEvent::Cancelled(s)) => {
                        info!(discovered = s.discovered, "scan cancelled");
                        summary = Some(s);
                    },
                    Err(err) => warn!(error = ?err, "scan problem"),
                }
            }
            summary
        });
        ScanHandle { cancel, task }
    }

    /// Cancels the running scan, if any.
    pub fn cancel(&self) {
        if let Some(current) = self.current.lock().unwrap_or_else(PoisonError::into_inner).take() {
            current.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) > 0
    }
}
