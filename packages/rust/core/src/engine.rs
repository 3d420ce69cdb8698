//! Incremental crawl-and-reconcile engine.
//!
//! A run pages through the parent listing (or reads stored parents, depending
//! on the [`Phase`]) and drives every parent through
//! `DISCOVERED -> DETAILED -> PROCESSED`:
//!
//! 1. **Dedup on sight**: a parent already PROCESSED is skipped without any
//!    network call.
//! 2. **Reconciliation**: a parent seen in an earlier, unfinished state has
//!    its stale children removed before any child is re-created. If the
//!    previous pass never finished listing children, every child is purged
//!    and the detail is fetched again; otherwise only children that did not
//!    reach PROCESSED are removed and re-derived.
//! 3. **Children**: all child pages are listed through exhaustion, then child
//!    details are fetched concurrently. A failing child never aborts its
//!    siblings.
//! 4. **Completion**: the parent becomes PROCESSED only after every one of its
//!    children is PROCESSED or permanently failed.
//!
//! Record-level failures are counted and logged; only store, config and
//! cancellation errors end the run.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use hackcrawl_crawler::SourceClient;
use hackcrawl_shared::text::{normalize, normalize_all};
use hackcrawl_shared::{
    Categories, ChildRecord, ChildSummary, CrawlConfig, HackCrawlError, ParentRecord,
    ParentSummary, RecordKind, RecordState, Result,
};
use hackcrawl_storage::IdentityStore;

use crate::retry::with_retry;
use crate::summary::{ProgressReporter, RecordOutcome, RunSummary};

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Which slice of the pipeline a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Page the listing and create eligible unseen parents as DISCOVERED.
    DiscoverParents,
    /// Fetch the detail of every stored DISCOVERED parent.
    DetailParents,
    /// Reconcile, enumerate and detail the children of every stored DETAILED parent.
    DetailChildren,
    /// Page the listing and run the whole pipeline per parent.
    Full,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Self::DiscoverParents,
        Self::DetailParents,
        Self::DetailChildren,
        Self::Full,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DiscoverParents => "discover-parents",
            Self::DetailParents => "detail-parents",
            Self::DetailChildren => "detail-children",
            Self::Full => "full",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::DiscoverParents => "Discovering parents",
            Self::DetailParents => "Fetching parent details",
            Self::DetailChildren => "Crawling children",
            Self::Full => "Crawling",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown phase: {s}"))
    }
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

/// Cursor over one paginated listing.
///
/// A listing is exhausted once the number of consecutive empty pages exceeds
/// the tolerance. Failed pages are neither empty nor non-empty and leave the
/// empty-run count untouched.
#[derive(Debug)]
struct Pager {
    next: u32,
    requested: u32,
    max_pages: Option<u32>,
    tolerance: u32,
    empty_run: u32,
}

impl Pager {
    fn new(start: u32, tolerance: u32, max_pages: Option<u32>) -> Self {
        Self {
            next: start,
            requested: 0,
            max_pages,
            tolerance,
            empty_run: 0,
        }
    }

    /// The next page to request, or `None` once the page cap is reached.
    fn next_page(&mut self) -> Option<u32> {
        if self.max_pages.is_some_and(|max| self.requested >= max) {
            return None;
        }
        let page = self.next;
        self.next = self.next.saturating_add(1);
        self.requested += 1;
        Some(page)
    }

    /// Record the size of a fetched page. Returns `true` once exhausted.
    fn observe(&mut self, len: usize) -> bool {
        if len == 0 {
            self.empty_run += 1;
            self.empty_run > self.tolerance
        } else {
            self.empty_run = 0;
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Run context
// ---------------------------------------------------------------------------

/// State shared by the concurrent units of one run.
struct RunContext<'a> {
    phase: Phase,
    progress: &'a dyn ProgressReporter,
    /// Child of the caller's token; also cancelled internally on a run-fatal error.
    token: CancellationToken,
    /// Parents already taken by a unit in this run.
    claimed: Mutex<HashSet<String>>,
    summary: Mutex<RunSummary>,
}

impl RunContext<'_> {
    fn check_cancelled(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(HackCrawlError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn claim(&self, external_id: &str) -> bool {
        self.claimed.lock().await.insert(external_id.to_string())
    }

    async fn count(&self, kind: RecordKind, external_id: &str, outcome: RecordOutcome) {
        self.summary.lock().await.counts_mut(kind).record(outcome);
        self.progress.record_done(kind, external_id, outcome);
    }
}

/// A child admitted for detail fetching, with its listing-time outcome.
struct PendingChild {
    record: ChildRecord,
    outcome: RecordOutcome,
}

// ---------------------------------------------------------------------------
// CrawlEngine
// ---------------------------------------------------------------------------

/// Drives parents and children from the source into the identity store.
pub struct CrawlEngine {
    source: Arc<dyn SourceClient>,
    store: Arc<dyn IdentityStore>,
    config: CrawlConfig,
}

impl CrawlEngine {
    /// Create an engine over an injected source and store.
    pub fn new(
        source: Arc<dyn SourceClient>,
        store: Arc<dyn IdentityStore>,
        config: CrawlConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            store,
            config,
        })
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }

    /// Execute one run of `phase`.
    ///
    /// Returns the run summary, with `cancelled` set if `cancel` fired. Store
    /// and configuration failures are returned as errors.
    #[instrument(skip_all, fields(phase = %phase))]
    pub async fn run(
        &self,
        phase: Phase,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let start = Instant::now();
        let run_id = self.store.begin_run(phase.as_str()).await?;

        info!(
            %run_id,
            start_page = self.config.start_page,
            max_pages = ?self.config.max_pages,
            parent_concurrency = self.config.parent_concurrency,
            child_concurrency = self.config.child_concurrency,
            "starting crawl run"
        );
        progress.phase(phase.label());

        let ctx = RunContext {
            phase,
            progress,
            token: cancel.child_token(),
            claimed: Mutex::default(),
            summary: Mutex::new(RunSummary::new(phase)),
        };

        let result = match phase {
            Phase::DiscoverParents | Phase::Full => self.traverse_listing(&ctx).await,
            Phase::DetailParents => self.drive_stored(&ctx, RecordState::Discovered).await,
            Phase::DetailChildren => self.drive_stored(&ctx, RecordState::Detailed).await,
        };

        let mut summary = ctx.summary.into_inner();
        summary.elapsed = start.elapsed();

        match result {
            Ok(()) => {}
            Err(HackCrawlError::Cancelled) => {
                warn!("crawl run cancelled");
                summary.cancelled = true;
            }
            Err(e) => {
                warn!(error = %e, "crawl run failed");
                return Err(e);
            }
        }

        let stats = serde_json::to_string(&summary)
            .map_err(|e| HackCrawlError::validation(format!("run summary: {e}")))?;
        self.store.finish_run(&run_id, &stats).await?;

        info!(
            parents_created = summary.parents.created,
            parents_skipped = summary.parents.skipped,
            parents_failed = summary.parents.failed,
            children_created = summary.children.created,
            children_failed = summary.children.failed,
            pages_listed = summary.pages_listed,
            pages_failed = summary.pages_failed,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "crawl run finished"
        );
        progress.done(&summary);
        Ok(summary)
    }

    // -----------------------------------------------------------------------
    // Parent sources
    // -----------------------------------------------------------------------

    /// Page through the parent listing until exhaustion, the page cap, or
    /// too many consecutive failed pages.
    async fn traverse_listing(&self, ctx: &RunContext<'_>) -> Result<()> {
        let mut pager = Pager::new(
            self.config.start_page,
            self.config.empty_page_tolerance,
            self.config.max_pages,
        );
        let mut consecutive_failures = 0u32;
        let source = self.source.as_ref();

        while let Some(page) = pager.next_page() {
            ctx.check_cancelled()?;

            let listed = match with_retry(&self.config.retry, "list_parents", move || {
                source.list_parents(page)
            })
            .await
            {
                Ok(listed) => listed,
                Err(e) if e.is_run_fatal() => return Err(e),
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(page, consecutive_failures, error = %e, "listing page failed");
                    ctx.summary.lock().await.pages_failed += 1;

                    if consecutive_failures >= self.config.max_consecutive_page_failures {
                        let reason = format!(
                            "{consecutive_failures} consecutive listing pages failed, last was page {page}: {e}"
                        );
                        warn!(%reason, "aborting run");
                        ctx.summary.lock().await.aborted = Some(reason);
                        return Ok(());
                    }
                    continue;
                }
            };

            consecutive_failures = 0;
            ctx.summary.lock().await.pages_listed += 1;
            ctx.progress.page_listed(page, listed.len());
            debug!(page, records = listed.len(), "listing page fetched");

            let exhausted = pager.observe(listed.len());
            join_units(
                ctx,
                self.config.parent_concurrency,
                listed
                    .into_iter()
                    .map(|summary| self.listed_parent_unit(ctx, summary)),
            )
            .await?;

            if exhausted {
                info!(page, "listing exhausted");
                break;
            }
        }
        Ok(())
    }

    /// Drive every stored parent currently in `state`.
    async fn drive_stored(&self, ctx: &RunContext<'_>, state: RecordState) -> Result<()> {
        let parents = self.store.list_parents(state).await?;
        info!(count = parents.len(), %state, "loaded stored parents");

        join_units(
            ctx,
            self.config.parent_concurrency,
            parents
                .into_iter()
                .map(|parent| self.stored_parent_unit(ctx, parent)),
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Parent units
    // -----------------------------------------------------------------------

    async fn listed_parent_unit(
        &self,
        ctx: &RunContext<'_>,
        mut summary: ParentSummary,
    ) -> Result<()> {
        ctx.check_cancelled()?;

        summary.external_id = summary.external_id.trim().to_string();
        if summary.external_id.is_empty() {
            match self.identify_by_slug(&summary).await? {
                Some(external_id) => summary.external_id = external_id,
                None => {
                    warn!(name = %summary.name, "listing record has no usable identity, skipping");
                    ctx.count(RecordKind::Parent, "", RecordOutcome::Failed).await;
                    return Ok(());
                }
            }
        }
        if !summary.eligible {
            debug!(external_id = %summary.external_id, "not eligible, skipping");
            return Ok(());
        }
        if !ctx.claim(&summary.external_id).await {
            debug!(external_id = %summary.external_id, "already handled in this run");
            return Ok(());
        }

        let external_id = summary.external_id.clone();
        let result = self.listed_parent(ctx, summary).await;
        self.settle_parent(ctx, &external_id, result).await
    }

    /// Resolve a listing record without an external id through its slug.
    /// Only parents already stored can be identified this way.
    async fn identify_by_slug(&self, summary: &ParentSummary) -> Result<Option<String>> {
        let Some(slug) = summary.slug.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let found = self.store.get_parent_by_slug(slug).await?;
        if let Some(parent) = &found {
            debug!(slug, external_id = %parent.external_id, "identified by slug");
        }
        Ok(found.map(|p| p.external_id))
    }

    async fn stored_parent_unit(&self, ctx: &RunContext<'_>, parent: ParentRecord) -> Result<()> {
        ctx.check_cancelled()?;
        if !ctx.claim(&parent.external_id).await {
            return Ok(());
        }

        let external_id = parent.external_id.clone();
        let result = match ctx.phase {
            Phase::DetailParents => self.detail_parent(parent).await.map(|_| RecordOutcome::Updated),
            _ => self
                .drive_parent(ctx, parent, false)
                .await
                .map(|()| RecordOutcome::Updated),
        };
        self.settle_parent(ctx, &external_id, result).await
    }

    /// Count a parent's outcome. Record-level errors are logged, written to
    /// the failure ledger and swallowed.
    async fn settle_parent(
        &self,
        ctx: &RunContext<'_>,
        external_id: &str,
        result: Result<RecordOutcome>,
    ) -> Result<()> {
        match result {
            Ok(outcome) => {
                if outcome != RecordOutcome::Skipped {
                    self.store.clear_failure(RecordKind::Parent, external_id).await?;
                }
                ctx.count(RecordKind::Parent, external_id, outcome).await;
                Ok(())
            }
            Err(e) if e.is_run_fatal() => Err(e),
            Err(e) => {
                warn!(external_id, error = %e, "parent failed");
                self.store
                    .record_failure(RecordKind::Parent, external_id, None, &e.to_string())
                    .await?;
                ctx.count(RecordKind::Parent, external_id, RecordOutcome::Failed).await;
                Ok(())
            }
        }
    }

    /// Dedup a listed parent against the store and, in a full run, drive it.
    #[instrument(skip_all, fields(external_id = %summary.external_id))]
    async fn listed_parent(
        &self,
        ctx: &RunContext<'_>,
        summary: ParentSummary,
    ) -> Result<RecordOutcome> {
        let existing = self.store.get_parent(&summary.external_id).await?;

        if let Some(parent) = &existing {
            if parent.state == RecordState::Processed {
                debug!("already processed, skipping");
                return Ok(RecordOutcome::Skipped);
            }
            info!(
                state = %parent.state,
                children_listed = parent.children_listed,
                "resuming unfinished parent"
            );
        }

        let mut record =
            existing.unwrap_or_else(|| ParentRecord::new(summary.external_id.clone()));
        apply_listing(&mut record, &summary);
        let (stored, upserted) = self.store.upsert_parent(&record).await?;

        if ctx.phase == Phase::Full {
            self.drive_parent(ctx, stored, true).await?;
        }
        Ok(upserted.into())
    }

    /// Fetch and store a parent's overview. DISCOVERED parents advance to DETAILED.
    async fn detail_parent(&self, mut parent: ParentRecord) -> Result<ParentRecord> {
        let source = self.source.as_ref();
        let target = &parent;
        let detail = with_retry(&self.config.retry, "parent_detail", move || {
            source.parent_detail(target)
        })
        .await?;

        parent.description = normalize(&detail.description);
        if !detail.url.trim().is_empty() {
            parent.url = detail.url.trim().to_string();
        }
        let (mut stored, _) = self.store.upsert_parent(&parent).await?;

        if stored.state == RecordState::Discovered {
            self.store
                .set_parent_state(&stored.id, RecordState::Detailed)
                .await?;
            stored.state = RecordState::Detailed;
        }
        debug!(external_id = %stored.external_id, "parent detailed");
        Ok(stored)
    }

    /// Reconcile, enumerate and settle the children of an unfinished parent,
    /// then try to complete it.
    #[instrument(skip_all, fields(external_id = %parent.external_id))]
    async fn drive_parent(
        &self,
        ctx: &RunContext<'_>,
        parent: ParentRecord,
        refetch_detail: bool,
    ) -> Result<()> {
        let targeted = parent.children_listed;
        let removed = if targeted {
            self.store.delete_unfinished_children_of(&parent.id).await?
        } else {
            self.store.delete_children_of(&parent.id).await?
        };
        if removed > 0 {
            info!(removed, targeted, "cleared stale children");
        }

        let mut parent = if parent.state == RecordState::Discovered || (refetch_detail && !targeted)
        {
            ctx.check_cancelled()?;
            self.detail_parent(parent).await?
        } else {
            parent
        };

        let pending = self.enumerate_children(ctx, &parent).await?;
        if !parent.children_listed {
            parent.children_listed = true;
            parent = self.store.upsert_parent(&parent).await?.0;
        }

        let parent = &parent;
        join_units(
            ctx,
            self.config.child_concurrency,
            pending
                .into_iter()
                .map(|child| self.child_unit(ctx, parent, child)),
        )
        .await?;

        self.complete_parent(parent).await
    }

    /// Advance the parent to PROCESSED once every child is settled.
    async fn complete_parent(&self, parent: &ParentRecord) -> Result<()> {
        let children = self.store.list_children_of(&parent.id).await?;

        let mut unsettled = Vec::new();
        for child in &children {
            if child.state == RecordState::Processed {
                continue;
            }
            if !self.is_permanently_failed(&child.external_id).await? {
                unsettled.push(child.external_id.as_str());
            }
        }

        if unsettled.is_empty() {
            self.store
                .set_parent_state(&parent.id, RecordState::Processed)
                .await?;
            info!(children = children.len(), "parent processed");
        } else {
            info!(?unsettled, "parent left incomplete");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Children
    // -----------------------------------------------------------------------

    /// List every child page of `parent` and admit each child to the store.
    async fn enumerate_children(
        &self,
        ctx: &RunContext<'_>,
        parent: &ParentRecord,
    ) -> Result<Vec<PendingChild>> {
        let mut pager = Pager::new(0, self.config.empty_page_tolerance, None);
        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        let source = self.source.as_ref();
        let parent_external_id = parent.external_id.as_str();

        while let Some(page) = pager.next_page() {
            ctx.check_cancelled()?;

            let listed = with_retry(&self.config.retry, "list_children", move || {
                source.list_children(parent_external_id, page)
            })
            .await?;
            let exhausted = pager.observe(listed.len());

            for summary in listed {
                if summary.external_id.is_empty() {
                    warn!(title = %summary.title, "child has no external id, skipping");
                    ctx.count(RecordKind::Child, "", RecordOutcome::Failed).await;
                    continue;
                }
                if !seen.insert(summary.external_id.clone()) {
                    continue;
                }

                let external_id = summary.external_id.clone();
                match self.admit_child(ctx, parent, summary).await {
                    Ok(Some(child)) => pending.push(child),
                    Ok(None) => {}
                    Err(e) if e.is_run_fatal() => return Err(e),
                    Err(e) => {
                        warn!(%external_id, error = %e, "child rejected");
                        ctx.count(RecordKind::Child, &external_id, RecordOutcome::Failed)
                            .await;
                    }
                }
            }

            if exhausted {
                break;
            }
        }

        debug!(pending = pending.len(), "children enumerated");
        Ok(pending)
    }

    /// Upsert a listed child under `parent`. Returns `None` when nothing is
    /// left to fetch for it in this run.
    async fn admit_child(
        &self,
        ctx: &RunContext<'_>,
        parent: &ParentRecord,
        summary: ChildSummary,
    ) -> Result<Option<PendingChild>> {
        let existing = self.store.get_child(&summary.external_id).await?;

        if let Some(mut child) = existing.clone() {
            if child.parent_id != parent.id {
                warn!(
                    external_id = %child.external_id,
                    parent = %parent.external_id,
                    "child listed under a different parent, re-parenting"
                );
            }
            if child.state == RecordState::Processed {
                if child.parent_id != parent.id {
                    child.parent_id = parent.id.clone();
                    self.store.upsert_child(&child).await?;
                }
                ctx.count(RecordKind::Child, &child.external_id, RecordOutcome::Skipped)
                    .await;
                return Ok(None);
            }
        }

        let mut record = existing
            .unwrap_or_else(|| ChildRecord::new(summary.external_id.clone(), parent.id.clone()));
        record.parent_id = parent.id.clone();
        record.title = normalize(&summary.title);
        record.description = normalize(&summary.description);
        if let Some(url) = summary.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            record.url = url.to_string();
        }
        let (stored, upserted) = self.store.upsert_child(&record).await?;

        if self.is_permanently_failed(&stored.external_id).await? {
            debug!(external_id = %stored.external_id, "permanently failed, not retried");
            ctx.count(RecordKind::Child, &stored.external_id, RecordOutcome::Failed)
                .await;
            return Ok(None);
        }

        Ok(Some(PendingChild {
            record: stored,
            outcome: upserted.into(),
        }))
    }

    /// Fetch one child's detail, isolating its failure from siblings.
    async fn child_unit(
        &self,
        ctx: &RunContext<'_>,
        parent: &ParentRecord,
        pending: PendingChild,
    ) -> Result<()> {
        ctx.check_cancelled()?;
        let external_id = pending.record.external_id.clone();

        match self.detail_child(pending.record).await {
            Ok(()) => {
                self.store.clear_failure(RecordKind::Child, &external_id).await?;
                ctx.count(RecordKind::Child, &external_id, pending.outcome).await;
                Ok(())
            }
            Err(e) if e.is_run_fatal() => Err(e),
            Err(e) => {
                let failure = self
                    .store
                    .record_failure(RecordKind::Child, &external_id, Some(&parent.id), &e.to_string())
                    .await?;
                let permanent = failure.attempts >= self.config.child_failure_limit;
                warn!(
                    %external_id,
                    attempts = failure.attempts,
                    permanent,
                    error = %e,
                    "child failed"
                );
                ctx.count(RecordKind::Child, &external_id, RecordOutcome::Failed).await;
                Ok(())
            }
        }
    }

    async fn detail_child(&self, mut child: ChildRecord) -> Result<()> {
        let source = self.source.as_ref();
        let target = &child;
        let detail = with_retry(&self.config.retry, "child_detail", move || {
            source.child_detail(target)
        })
        .await?;

        if let Some(title) = detail.title.as_deref().map(normalize).filter(|t| !t.is_empty()) {
            child.title = title;
        }
        let description = normalize(&detail.description);
        if !description.is_empty() {
            child.description = description;
        }
        child.tags = normalize_all(&detail.tags).into_iter().collect();
        if let Some(url) = detail.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            child.url = url.to_string();
        }

        let (stored, _) = self.store.upsert_child(&child).await?;
        let mut state = stored.state;
        for to in [RecordState::Detailed, RecordState::Processed] {
            if state.can_advance_to(to) {
                self.store.set_child_state(&stored.id, to).await?;
                state = to;
            }
        }
        debug!(external_id = %stored.external_id, "child processed");
        Ok(())
    }

    async fn is_permanently_failed(&self, external_id: &str) -> Result<bool> {
        Ok(self
            .store
            .get_failure(RecordKind::Child, external_id)
            .await?
            .is_some_and(|f| f.attempts >= self.config.child_failure_limit))
    }
}

/// Copy listing fields onto a record. An assigned slug is kept.
fn apply_listing(record: &mut ParentRecord, summary: &ParentSummary) {
    record.name = normalize(&summary.name);
    if record.slug.is_none() {
        record.slug = summary
            .slug
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from);
    }
    record.org_id = summary.org.id.trim().to_string();
    record.org_name = normalize(&summary.org.name);
    record.org_slug = summary.org.slug.trim().to_string();
    record.categories = Categories(normalize_all(&summary.categories));
}

/// Run `units` with at most `concurrency` in flight and wait for all of them.
///
/// The first run-fatal error cancels the run token so that remaining units
/// stop at their next boundary; a real failure wins over `Cancelled`.
async fn join_units<I, Fut>(ctx: &RunContext<'_>, concurrency: usize, units: I) -> Result<()>
where
    I: IntoIterator<Item = Fut>,
    Fut: Future<Output = Result<()>>,
{
    let mut running = stream::iter(units).buffer_unordered(concurrency);
    let mut fatal: Option<HackCrawlError> = None;

    while let Some(result) = running.next().await {
        if let Err(e) = result {
            ctx.token.cancel();
            let replace = match &fatal {
                None => true,
                Some(HackCrawlError::Cancelled) => !matches!(e, HackCrawlError::Cancelled),
                Some(_) => false,
            };
            if replace {
                fatal = Some(e);
            }
        }
    }

    fatal.map_or(Ok(()), Err)
}
