//! Extract, resolve, build, move, record.
//!
//! [`Pipeline::handle`] takes one candidate path all the way to a
//! [`MoveRecord`]. Settings are loaded fresh for every call, so a changed
//! layout or rotated API token applies to the very next file.
//!
//! Nothing that goes wrong with an individual file escapes as an error: it
//! ends up in the journal as a skipped or failed record instead.

use crate::error::{ErrorKind, Result};
use crate::event::{EventKind, MonitoredEvent};
use crate::filter::Filter;
use crate::inflight::InFlight;
use crate::journal::{Journal, MoveRecord};
use crate::stability::{Readiness, unchanged_since, wait_until_stable};
use crate::template::PathGenerator;
use docket_config::{MAX_RESOLVE_RETRIES, Settings, SettingsSource};
use docket_extract::models::{TicketId, TicketMetadata};
use docket_extract::{Extractor, ZONE_IDENTIFIER_STREAM, referrer_ticket};
use docket_redmine::ResolverHandle;
use docket_redmine::error::Result as ResolveResult;
use docket_storage::{Moved, Mover, Strategy};
use exn::ResultExt;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use time::UtcOffset;
use tracing::{debug, error, info, instrument, trace, warn};

/// Linear backoff step between resolution retries.
const RESOLVE_BACKOFF: Duration = Duration::from_millis(500);

/// Builds a resolver for one invocation from freshly loaded settings.
pub trait ResolverFactory: Send + Sync {
    fn resolver(&self, settings: &Settings) -> ResolverHandle;
}

impl<F> ResolverFactory for F
where
    F: Fn(&Settings) -> ResolverHandle + Send + Sync,
{
    fn resolver(&self, settings: &Settings) -> ResolverHandle {
        self(settings)
    }
}

/// Which optional side effects the settings asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Effects {
    pub notify: bool,
    pub open_folder: bool,
}

/// Desktop side effects. Implementations must not block: anything slow is
/// spawned and bounded by its own timeout, and nothing here can change the
/// outcome of a move.
pub trait Notifier: Send + Sync {
    fn recorded(&self, _record: &MoveRecord, _effects: Effects) {}
    fn warning(&self, _message: &str) {}
}

/// A [`Notifier`] that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Quiet;
impl Notifier for Quiet {}

/// Resolved tickets, shared by the files of a single scan.
#[derive(Debug, Default)]
pub struct ResolutionCache(Mutex<HashMap<TicketId, TicketMetadata>>);

impl ResolutionCache {
    fn get(&self, id: &TicketId) -> Option<TicketMetadata> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    fn insert(&self, metadata: TicketMetadata) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).insert(metadata.id.clone(), metadata);
    }
}

/// Size and mtime of a file when we skipped it.
type Fingerprint = (u64, Option<SystemTime>);

/// Everything derived from one load of the settings.
struct Context {
    settings: Settings,
    extractor: Extractor,
    generator: PathGenerator,
    resolver: ResolverHandle,
    mover: Mover,
}

impl Context {
    fn new(settings: Settings, resolver: ResolverHandle, offset: UtcOffset) -> Result<Self> {
        let extractor = Extractor::new(&settings.ticket_pattern).or_raise(|| ErrorKind::Settings)?;
        let generator = PathGenerator::new(&settings.layout, offset)?;
        Ok(Self {
            mover: Mover::new(settings.move_retries, settings.move_backoff()),
            extractor,
            generator,
            resolver,
            settings,
        })
    }

    fn effects(&self) -> Effects {
        Effects { notify: self.settings.notifications_enabled, open_folder: self.settings.open_folder_on_move }
    }
}

pub struct Pipeline {
    source: Arc<dyn SettingsSource>,
    resolvers: Arc<dyn ResolverFactory>,
    notifier: Arc<dyn Notifier>,
    journal: Arc<Journal>,
    inflight: InFlight,
    /// One entry per path; a changed file replaces its old fingerprint.
    skipped: Mutex<HashMap<PathBuf, Fingerprint>>,
    offset: UtcOffset,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn SettingsSource>,
        resolvers: Arc<dyn ResolverFactory>,
        notifier: Arc<dyn Notifier>,
        journal: Arc<Journal>,
        offset: UtcOffset,
    ) -> Self {
        Self {
            source,
            resolvers,
            notifier,
            journal,
            inflight: InFlight::default(),
            skipped: Mutex::new(HashMap::new()),
            offset,
        }
    }

    pub fn settings(&self) -> Result<Settings> {
        self.source.load().or_raise(|| ErrorKind::Settings)
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.inflight
    }

    pub fn notifier(&self) -> &dyn Notifier {
        self.notifier.as_ref()
    }

    /// Compiles the ticket pattern and the layout, so that settings every
    /// file would fail on are rejected up front.
    pub fn check(&self, settings: &Settings) -> Result<()> {
        Extractor::new(&settings.ticket_pattern).or_raise(|| ErrorKind::Settings)?;
        PathGenerator::new(&settings.layout, self.offset)?;
        Ok(())
    }

    /// Drops remembered skips for files that are no longer there.
    pub async fn forget_vanished_skips(&self) {
        let remembered: Vec<PathBuf> = self.skipped.lock().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        let mut vanished = HashSet::new();
        for path in remembered {
            if !tokio::fs::try_exists(&path).await.unwrap_or(true) {
                vanished.insert(path);
            }
        }
        if vanished.is_empty() {
            return;
        }
        debug!(count = vanished.len(), "forgetting skips of vanished files");
        self.skipped.lock().unwrap_or_else(PoisonError::into_inner).retain(|path, _| !vanished.contains(path));
    }

    /// Processes one candidate path, journals the outcome and fires side
    /// effects.
    ///
    /// Returns `None` when there was nothing to record: the path is ignored
    /// by the filter, already being processed, not (or no longer) a finished
    /// file, or a skip we already recorded for this exact file.
    #[instrument(skip_all, fields(path = %event.path.display(), kind = %event.kind))]
    pub async fn handle(&self, event: MonitoredEvent, cache: Option<&ResolutionCache>) -> Option<MoveRecord> {
        let Some(_claim) = self.inflight.try_claim(&event.path) else {
            debug!("already in flight");
            return None;
        };
        let settings = match self.settings() {
            Ok(settings) => settings,
            Err(err) => {
                error!(error = ?err, "cannot process files without settings");
                return None;
            },
        };
        if !Filter::from_settings(&settings).accepts(&event.path) {
            trace!("ignored by filter");
            return None;
        }
        let stability = &settings.stability;
        let readiness = wait_until_stable(&event.path, stability.interval(), stability.attempts).await;
        if !matches!(readiness, Readiness::Stable { .. }) {
            debug!(?readiness, "not a finished file; dropping");
            return None;
        }

        let resolver = self.resolvers.resolver(&settings);
        let record = match Context::new(settings, resolver, self.offset) {
            Ok(ctx) => self.process(&ctx, &event, readiness, cache).await.map(|record| (record, ctx.effects())),
            Err(err) => {
                error!(error = ?err, "invalid ticket pattern or layout");
                Some((MoveRecord::failed(&event, None, format!("settings: {}", *err)), Effects::default()))
            },
        };
        let (record, effects) = record?;
        // Failures are already reported by the journal itself.
        let _ = self.journal.append(&record).await;
        self.notifier.recorded(&record, effects);
        Some(record)
    }

    async fn process(
        &self,
        ctx: &Context,
        event: &MonitoredEvent,
        readiness: Readiness,
        cache: Option<&ResolutionCache>,
    ) -> Option<MoveRecord> {
        let Readiness::Stable { size, modified } = readiness else {
            return None;
        };

        let Some(ticket) = self.ticket(ctx, &event.path).await else {
            let fingerprint = (size, modified);
            let previous = self.skipped.lock().unwrap_or_else(PoisonError::into_inner).insert(event.path.clone(), fingerprint);
            if previous == Some(fingerprint) {
                trace!("skip already recorded");
                return None;
            }
            debug!("no ticket identifier");
            return Some(MoveRecord::skipped(event, "no ticket identifier in file name"));
        };

        let metadata = match self.resolve(ctx, &ticket, cache).await {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(%ticket, error = %*err, "could not resolve ticket");
                return Some(MoveRecord::failed(event, Some(ticket), format!("resolve: {}", *err)));
            },
        };
        let modified = modified.unwrap_or_else(SystemTime::now);
        let directory = match ctx.generator.build(&ctx.settings.organizing_root, &metadata, modified) {
            Ok(directory) => directory,
            Err(err) => {
                warn!(%ticket, error = ?err, "could not build destination");
                return Some(MoveRecord::failed(event, Some(ticket), format!("template: {}", *err)));
            },
        };

        // Resolving can take a while; make sure we're still moving the file
        // we looked at.
        if !unchanged_since(&event.path, readiness).await {
            debug!("changed or vanished while resolving; dropping");
            return None;
        }
        match ctx.mover.relocate(&event.path, &directory).await {
            Ok(moved) => {
                info!(%ticket, destination = %moved.destination.display(), "moved");
                let reason = describe(&moved);
                Some(MoveRecord::success(event, ticket, moved.destination, reason))
            },
            Err(err) => {
                warn!(%ticket, error = ?err, "move failed");
                Some(MoveRecord::failed(event, Some(ticket), format!("move: {}", *err)))
            },
        }
    }

    /// From the file name, or failing that from the download's referrer.
    async fn ticket(&self, ctx: &Context, path: &Path) -> Option<TicketId> {
        if let Some(ticket) = ctx.extractor.extract_from_path(path) {
            return Some(ticket);
        }
        if !ctx.settings.use_zone_identifier {
            return None;
        }
        let mut stream = path.as_os_str().to_os_string();
        stream.push(":");
        stream.push(ZONE_IDENTIFIER_STREAM);
        let content = tokio::fs::read_to_string(PathBuf::from(stream)).await.ok()?;
        let ticket = referrer_ticket(&content)?;
        debug!(%ticket, "ticket taken from download referrer");
        Some(ticket)
    }

    /// Only failures the resolver calls retryable (timeouts, unreachable or
    /// erroring servers) are worth another attempt.
    async fn resolve(
        &self,
        ctx: &Context,
        ticket: &TicketId,
        cache: Option<&ResolutionCache>,
    ) -> ResolveResult<TicketMetadata> {
        if let Some(metadata) = cache.and_then(|c| c.get(ticket)) {
            trace!("resolution cached for this scan");
            return Ok(metadata);
        }
        let retries = ctx.settings.resolve_retries.min(MAX_RESOLVE_RETRIES);
        let mut attempt = 0;
        loop {
            let err = match ctx.resolver.resolve(ticket, ctx.settings.request_timeout()).await {
                Ok(metadata) => {
                    if let Some(cache) = cache {
                        cache.insert(metadata.clone());
                    }
                    return Ok(metadata);
                },
                Err(err) => err,
            };
            let kind = *err;
            if attempt >= retries || !kind.is_retryable() {
                return Err(err);
            }
            attempt += 1;
            warn!(attempt, retries, error = %kind, "retrying ticket resolution");
            tokio::time::sleep(RESOLVE_BACKOFF * attempt).await;
        }
    }
}

fn describe(moved: &Moved) -> String {
    let how = match moved.strategy {
        Strategy::Renamed => "moved",
        Strategy::Copied => "copied across volumes and verified",
    };
    match moved.disambiguated {
        true => format!("{how} under a numbered name; the original name was taken"),
        false => how.to_string(),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::journal::Outcome;
    use docket_redmine::MockResolver;
    use docket_redmine::error::ErrorKind as ResolveErrorKind;
    use rstest::rstest;

    fn acme() -> MockResolver {
        MockResolver::with_tickets([("4521", "Acme", "Invoices", "[Q4] Invoice run")])
    }

    #[tokio::test]
    async fn test_ticket_file_is_filed_by_project_category_ticket_and_date() {
        let fixture = Fixture::new(acme());
        let source = fixture.download("invoice_TICKET-4521.pdf", "%PDF");
        let pipeline = fixture.pipeline();

        let record = pipeline.handle(created(&source), None).await.unwrap();

        let expected = fixture.root.join("Acme/Invoices/4521/20241217/invoice_TICKET-4521.pdf");
        assert_eq!(record.outcome, Outcome::Success);
        assert_eq!(record.destination.as_deref(), Some(expected.as_path()));
        assert_eq!(record.ticket.as_ref().map(TicketId::as_str), Some("4521"));
        assert!(!source.exists());
        assert_eq!(std::fs::read_to_string(&expected).unwrap(), "%PDF");
        assert_eq!(pipeline.journal().recent(10).await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn test_file_without_identifier_is_skipped_and_untouched() {
        let fixture = Fixture::new(acme());
        let source = fixture.download("holiday.jpg", "jpeg");
        let pipeline = fixture.pipeline();

        let record = pipeline.handle(created(&source), None).await.unwrap();

        assert_eq!(record.outcome, Outcome::Skipped);
        assert!(record.destination.is_none());
        assert!(source.exists());
        assert_eq!(fixture.resolver.calls(), 0);
        assert_eq!(pipeline.journal().recent(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_ticket_fails_and_leaves_file() {
        let fixture = Fixture::new(MockResolver::default());
        let source = fixture.download("report_TICKET-9999.pdf", "%PDF");
        let pipeline = fixture.pipeline();

        let record = pipeline.handle(created(&source), None).await.unwrap();

        assert_eq!(record.outcome, Outcome::Failed);
        assert_eq!(record.ticket.as_ref().map(TicketId::as_str), Some("9999"));
        assert!(record.reason.contains("ticket not found"), "{}", record.reason);
        assert!(source.exists());
        assert!(!fixture.root.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicates_yield_one_record() {
        let fixture = Fixture::new(acme().with_latency(Duration::from_millis(200)));
        let source = fixture.download("invoice_TICKET-4521.pdf", "%PDF");
        let pipeline = fixture.pipeline();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let pipeline = Arc::clone(&pipeline);
                let event = created(&source);
                tokio::spawn(async move { pipeline.handle(event, None).await })
            })
            .collect();
        let mut records = Vec::new();
        for handle in handles {
            records.extend(handle.await.unwrap());
        }

        assert_eq!(records.len(), 1);
        assert_eq!(pipeline.journal().recent(10).await.unwrap().len(), 1);
        assert_eq!(fixture.resolver.calls(), 1);
        assert!(pipeline.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_skip_is_recorded_once() {
        let fixture = Fixture::new(acme());
        let source = fixture.download("holiday.jpg", "jpeg");
        let pipeline = fixture.pipeline();

        assert!(pipeline.handle(created(&source), None).await.is_some());
        assert!(pipeline.handle(MonitoredEvent::new(&source, EventKind::Scanned), None).await.is_none());

        // A different file under the same name is new again.
        std::fs::write(&source, "another jpeg").unwrap();
        assert!(pipeline.handle(created(&source), None).await.is_some());
    }

    #[tokio::test]
    async fn test_skips_of_vanished_files_are_forgotten() {
        let fixture = Fixture::new(acme());
        let kept = fixture.download("holiday.jpg", "jpeg");
        let removed = fixture.download("notes.txt", "notes");
        let pipeline = fixture.pipeline();
        pipeline.handle(created(&kept), None).await.unwrap();
        pipeline.handle(created(&removed), None).await.unwrap();

        // Rewriting a file replaces its entry rather than adding one.
        std::fs::write(&kept, "another jpeg").unwrap();
        pipeline.handle(created(&kept), None).await.unwrap();
        assert_eq!(pipeline.skipped.lock().unwrap().len(), 2);

        std::fs::remove_file(&removed).unwrap();
        pipeline.forget_vanished_skips().await;
        let skipped = pipeline.skipped.lock().unwrap();
        assert_eq!(skipped.keys().collect::<Vec<_>>(), [&kept]);
    }

    #[tokio::test]
    async fn test_ignored_and_unfinished_files_are_not_recorded() {
        let fixture = Fixture::new(acme());
        let pipeline = fixture.pipeline();
        let partial = fixture.download("invoice_TICKET-4521.pdf.crdownload", "%PD");
        let empty = fixture.download("empty_TICKET-4521.pdf", "");

        assert!(pipeline.handle(created(&partial), None).await.is_none());
        assert!(pipeline.handle(created(&empty), None).await.is_none());
        assert!(pipeline.handle(created(&fixture.downloads.join("gone_TICKET-1.pdf")), None).await.is_none());
        assert!(pipeline.journal().recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ticket_from_zone_identifier() {
        let fixture = Fixture::new(acme());
        let source = fixture.download("invoice.pdf", "%PDF");
        std::fs::write(
            fixture.downloads.join("invoice.pdf:Zone.Identifier"),
            "[ZoneTransfer]\nZoneId=3\nReferrerUrl=https://redmine.invalid/issues/4521\n",
        )
        .unwrap();

        let record = fixture.pipeline().handle(created(&source), None).await.unwrap();
        assert_eq!(record.outcome, Outcome::Success);
        assert_eq!(record.ticket.as_ref().map(TicketId::as_str), Some("4521"));
    }

    #[tokio::test]
    async fn test_zone_identifier_can_be_disabled() {
        let mut fixture = Fixture::new(acme());
        fixture.settings.use_zone_identifier = false;
        let source = fixture.download("invoice.pdf", "%PDF");
        std::fs::write(fixture.downloads.join("invoice.pdf:Zone.Identifier"), "ReferrerUrl=https://x/issues/4521").unwrap();

        let record = fixture.pipeline().handle(created(&source), None).await.unwrap();
        assert_eq!(record.outcome, Outcome::Skipped);
    }

    #[tokio::test]
    async fn test_collision_is_disambiguated() {
        let fixture = Fixture::new(acme());
        let existing = fixture.root.join("Acme/Invoices/4521/20241217/invoice_TICKET-4521.pdf");
        std::fs::create_dir_all(existing.parent().unwrap()).unwrap();
        std::fs::write(&existing, "first").unwrap();
        let source = fixture.download("invoice_TICKET-4521.pdf", "second");

        let record = fixture.pipeline().handle(created(&source), None).await.unwrap();

        assert_eq!(record.outcome, Outcome::Success);
        assert_eq!(
            record.destination.unwrap(),
            fixture.root.join("Acme/Invoices/4521/20241217/invoice_TICKET-4521 (1).pdf")
        );
        assert_eq!(std::fs::read_to_string(&existing).unwrap(), "first");
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let mut fixture = Fixture::new(MockResolver::default());
        fixture.settings.resolve_retries = 2;
        fixture.resolver.fail("4521", ResolveErrorKind::Unreachable).await;
        let source = fixture.download("invoice_TICKET-4521.pdf", "%PDF");

        let record = fixture.pipeline().handle(created(&source), None).await.unwrap();
        assert_eq!(record.outcome, Outcome::Failed);
        assert_eq!(fixture.resolver.calls(), 3);
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let mut fixture = Fixture::new(MockResolver::default());
        fixture.settings.resolve_retries = 1;
        fixture.resolver.fail("4521", ResolveErrorKind::Status(503)).await;
        let source = fixture.download("invoice_TICKET-4521.pdf", "%PDF");

        let record = fixture.pipeline().handle(created(&source), None).await.unwrap();
        assert_eq!(record.outcome, Outcome::Failed);
        assert_eq!(fixture.resolver.calls(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failures_are_not_retried() {
        let mut fixture = Fixture::new(MockResolver::default());
        fixture.settings.resolve_retries = 3;
        fixture.resolver.fail("4521", ResolveErrorKind::Unauthorized).await;
        let source = fixture.download("invoice_TICKET-4521.pdf", "%PDF");

        let record = fixture.pipeline().handle(created(&source), None).await.unwrap();
        assert!(record.reason.contains("unauthorized"), "{}", record.reason);
        assert_eq!(fixture.resolver.calls(), 1);
    }

    #[tokio::test]
    async fn test_batch_cache_resolves_once() {
        let fixture = Fixture::new(acme());
        let first = fixture.download("a_TICKET-4521.pdf", "a");
        let second = fixture.download("b_TICKET-4521.pdf", "b");
        let pipeline = fixture.pipeline();
        let cache = ResolutionCache::default();

        pipeline.handle(created(&first), Some(&cache)).await.unwrap();
        pipeline.handle(created(&second), Some(&cache)).await.unwrap();
        assert_eq!(fixture.resolver.calls(), 1);
    }

    #[tokio::test]
    async fn test_bad_settings_do_not_record_ignored_or_unfinished_files() {
        let mut fixture = Fixture::new(acme());
        fixture.settings.layout = "{{ project".to_string();
        let pipeline = fixture.pipeline();
        let partial = fixture.download("invoice_TICKET-4521.pdf.part", "%PD");
        let hidden = fixture.download(".DS_Store", "");

        assert!(pipeline.handle(created(&partial), None).await.is_none());
        assert!(pipeline.handle(created(&hidden), None).await.is_none());
        assert!(pipeline.journal().recent(10).await.unwrap().is_empty());
    }

    #[rstest]
    #[case::unclosed_tag(|s: &mut Settings| s.layout = "{{ project".into())]
    #[case::bad_pattern(|s: &mut Settings| s.ticket_pattern = r"ticket-\d+".into())]
    fn test_check_rejects_unusable_settings(#[case] mutate: fn(&mut Settings)) {
        let mut fixture = Fixture::new(acme());
        mutate(&mut fixture.settings);
        let pipeline = fixture.pipeline();
        assert!(pipeline.check(&fixture.settings).is_err());
    }

    #[test]
    fn test_check_accepts_defaults() {
        let fixture = Fixture::new(acme());
        assert!(fixture.pipeline().check(&fixture.settings).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_layout_is_recorded_as_failure() {
        let mut fixture = Fixture::new(acme());
        fixture.settings.layout = "{{ project".to_string();
        let source = fixture.download("invoice_TICKET-4521.pdf", "%PDF");

        let record = fixture.pipeline().handle(created(&source), None).await.unwrap();
        assert_eq!(record.outcome, Outcome::Failed);
        assert!(record.reason.starts_with("settings:"), "{}", record.reason);
        assert!(source.exists());
    }
}
