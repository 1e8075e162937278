use crate::error::Result;
use crate::event::MonitoredEvent;
use crate::filter::Filter;
use crate::journal::{MoveRecord, Outcome};
use crate::pipeline::{Pipeline, ResolutionCache};
use crate::scan::scan;
use async_stream::stream;
use futures::stream::FuturesUnordered;
use futures::{Stream, StreamExt};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Progress events emitted by [`organize`].
///
/// Events follow a strict ordering:
/// 1. [`Started`](Self::Started): exactly once.
/// 2. [`Discovered`](Self::Discovered) and [`Processed`](Self::Processed):
///    interleaved, since files are processed while the walk continues.
/// 3. [`Complete`](Self::Complete) or [`Cancelled`](Self::Cancelled): exactly
///    once, signalling the stream is finished.
///
/// Unreadable directories are surfaced as `Err` items without terminating the
/// stream; only failing to load the settings is fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Started,
    Discovered(PathBuf),
    /// A file produced a journal record. Files that produce no record (already
    /// in flight, still downloading, a skip we already know about) don't
    /// appear here.
    Processed(MoveRecord),
    Complete(ScanSummary),
    /// Cancelled before the walk finished; every file that had been started
    /// was still processed to the end.
    Cancelled(ScanSummary),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub discovered: u64,
    pub succeeded: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl ScanSummary {
    fn count(&mut self, record: &MoveRecord) {
        match record.outcome {
            Outcome::Success => self.succeeded += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

enum Step {
    Cancelled,
    Walked(Option<Result<MonitoredEvent>>),
    Finished(Option<MoveRecord>),
    Drained,
}

/// Streams [`ScanEvent`]s for one pass over the monitored directory, running
/// each discovered file through `pipeline` with at most `scan_concurrency`
/// files in flight.
pub fn organize(pipeline: &Pipeline, cancel: CancellationToken) -> impl Stream<Item = Result<ScanEvent>> + '_ {
    // `rustfmt` does not format macros that use braces. Wrap in parentheses!
    stream!({
        yield Ok(ScanEvent::Started);

        let settings = match pipeline.settings() {
            Ok(settings) => settings,
            Err(e) => {
                yield Err(e);
                return;
            },
        };
        pipeline.forget_vanished_skips().await;
        let concurrency = settings.scan_concurrency.max(1);
        let cache = settings.cache_resolutions.then(ResolutionCache::default);
        let walk = scan(settings.monitored_directory.clone(), Filter::from_settings(&settings), settings.recursive);
        let mut walk = std::pin::pin!(walk);

        let mut processing = FuturesUnordered::new();
        let mut summary = ScanSummary::default();
        let mut walking = true;
        let mut cancelled = false;
        loop {
            // `yield` can't live inside `select!`, so pick a step first and
            // act on it afterwards.
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled(), if walking => Step::Cancelled,
                result = processing.next(), if !processing.is_empty() => Step::Finished(result.flatten()),
                next = walk.next(), if walking && processing.len() < concurrency => Step::Walked(next),
                else => Step::Drained,
            };
            match step {
                Step::Cancelled => {
                    walking = false;
                    cancelled = true;
                },
                Step::Finished(Some(record)) => {
                    summary.count(&record);
                    yield Ok(ScanEvent::Processed(record));
                },
                Step::Finished(None) => {},
                Step::Walked(Some(Ok(event))) => {
                    summary.discovered += 1;
                    yield Ok(ScanEvent::Discovered(event.path.clone()));
                    processing.push(pipeline.handle(event, cache.as_ref()));
                },
                Step::Walked(Some(Err(e))) => yield Err(e),
                Step::Walked(None) => walking = false,
                Step::Drained => break,
            }
        }

        yield Ok(match cancelled {
            true => ScanEvent::Cancelled(summary),
            false => ScanEvent::Complete(summary),
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::Fixture;
    use docket_redmine::MockResolver;
    use std::time::Duration;

    async fn run(pipeline: &Pipeline, cancel: CancellationToken) -> Vec<ScanEvent> {
        organize(pipeline, cancel).map(|event| event.unwrap()).collect().await
    }

    #[tokio::test]
    async fn test_scan_processes_existing_files() {
        let fixture = Fixture::new(MockResolver::with_tickets([("4521", "Acme", "Invoices", "t")]));
        fixture.download("invoice_TICKET-4521.pdf", "%PDF");
        fixture.download("holiday.jpg", "jpeg");
        fixture.download("unknown_TICKET-1.pdf", "%PDF");
        let pipeline = fixture.pipeline();

        let events = run(&pipeline, CancellationToken::new()).await;

        assert_eq!(events.first(), Some(&ScanEvent::Started));
        let summary = ScanSummary { discovered: 3, succeeded: 1, skipped: 1, failed: 1 };
        assert_eq!(events.last(), Some(&ScanEvent::Complete(summary)));
        let processed = events.iter().filter(|e| matches!(e, ScanEvent::Processed(_))).count();
        assert_eq!(processed, 3);
        assert!(fixture.root.join("Acme/Invoices/4521/20241217/invoice_TICKET-4521.pdf").exists());
    }

    #[tokio::test]
    async fn test_rescan_does_not_repeat_skips() {
        let fixture = Fixture::new(MockResolver::default());
        fixture.download("holiday.jpg", "jpeg");
        let pipeline = fixture.pipeline();

        run(&pipeline, CancellationToken::new()).await;
        let events = run(&pipeline, CancellationToken::new()).await;

        let summary = ScanSummary { discovered: 1, ..ScanSummary::default() };
        assert_eq!(events.last(), Some(&ScanEvent::Complete(summary)));
        assert_eq!(pipeline.journal().recent(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_cache_follows_settings() {
        let mut fixture = Fixture::new(MockResolver::with_tickets([("4521", "Acme", "Invoices", "t")]));
        fixture.settings.cache_resolutions = true;
        fixture.settings.scan_concurrency = 1;
        fixture.download("a_TICKET-4521.pdf", "a");
        fixture.download("b_TICKET-4521.pdf", "b");
        fixture.download("c_TICKET-4521.pdf", "c");

        run(&fixture.pipeline(), CancellationToken::new()).await;
        assert_eq!(fixture.resolver.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_start_processes_nothing() {
        let fixture = Fixture::new(MockResolver::default());
        fixture.download("holiday.jpg", "jpeg");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let events = run(&fixture.pipeline(), cancel).await;
        assert_eq!(events, vec![ScanEvent::Started, ScanEvent::Cancelled(ScanSummary::default())]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_lets_started_files_finish() {
        let mut fixture = Fixture::new(
            MockResolver::with_tickets([("1", "P", "C", "t"), ("2", "P", "C", "t"), ("3", "P", "C", "t")])
                .with_latency(Duration::from_millis(300)),
        );
        fixture.settings.scan_concurrency = 1;
        for n in 1..=3 {
            fixture.download(&format!("f_TICKET-{n}.pdf"), "x");
        }
        let pipeline = fixture.pipeline();
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            })
        };
        let events = run(&pipeline, cancel).await;
        canceller.await.unwrap();

        let Some(ScanEvent::Cancelled(summary)) = events.last() else {
            panic!("expected a cancelled scan, got {events:?}");
        };
        assert_eq!(summary.discovered, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(pipeline.journal().recent(10).await.unwrap().len(), 1);
    }
}
