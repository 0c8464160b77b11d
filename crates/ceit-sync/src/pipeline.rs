//! Sequential batch orchestration: schedule, collect, detect, extract, store, classify.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ceit_adapters::{
    html_to_text, CollaboratorError, Collector, ContentAnalyzer, RawContent, VisualBackend,
    VisualRecognition, VisualRecognizer,
};
use ceit_core::{
    ActivityEntry, ActivityOutcome, EquipmentChange, ItemKind, PriceRecord, SalesSignal, Snapshot,
    TrackedSite,
};
use ceit_extract::{
    attach_canonical_names, extract_prices, fold_case, partition_event_prices, CatalogMatcher,
    Decomposer, PriceConfig,
};
use ceit_storage::{Clock, Pacer, RunWrite, Store, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{PipelineConfig, Thresholds};
use crate::detect::{self, carry_visual_state, ChangeDecision, ChangeDetector};
use crate::report::ReportWriter;
use crate::schedule::{self, SiteFilter};
use crate::signals::{self, ProductRules};
use crate::snapshot::SnapshotDiff;

/// Per-site failure taxonomy. Only collection, recognition and persistence end a
/// site's run; the rest degrade it.
#[derive(Debug, Error)]
pub enum SiteError {
    #[error("collecting {url} failed: {reason}")]
    Collection { url: String, reason: String },
    #[error("subpage {url} omitted: {reason}")]
    Subpage { url: String, reason: String },
    #[error("content analysis failed: {0}")]
    Recognition(#[source] CollaboratorError),
    #[error("visual recognition skipped: {0}")]
    VisualRecognition(String),
    #[error("persisting run failed: {0}")]
    Persistence(#[from] StoreError),
    #[error("signal classification failed: {0}")]
    Classification(String),
}

impl SiteError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SiteError::Collection { .. } | SiteError::Recognition(_) | SiteError::Persistence(_)
        )
    }

    pub fn stage(&self) -> &'static str {
        match self {
            SiteError::Collection { .. } | SiteError::Subpage { .. } => "collecting",
            SiteError::Recognition(_) | SiteError::VisualRecognition(_) => "extracting",
            SiteError::Persistence(_) => "storing",
            SiteError::Classification(_) => "classifying",
        }
    }
}

/// Cooperative cancellation, honoured between sites only.
#[derive(Debug, Clone, Default)]
pub struct BatchCancel(Arc<AtomicBool>);

impl BatchCancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOptions {
    pub filter: SiteFilter,
    /// Never run the visual stage.
    pub text_only: bool,
    /// Enumerate and estimate only.
    pub dry_run: bool,
}

#[derive(Clone)]
pub struct Collaborators {
    pub collector: Arc<dyn Collector>,
    pub analyzer: Arc<dyn ContentAnalyzer>,
    pub visual: Option<Arc<dyn VisualBackend>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionLimits {
    pub max_subpages: usize,
    pub max_images: usize,
}

impl Default for CollectionLimits {
    fn default() -> Self {
        Self {
            max_subpages: 5,
            max_images: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteReport {
    pub site_id: Uuid,
    pub site_name: String,
    pub snapshot_id: Uuid,
    pub decision: ChangeDecision,
    pub diff_summary: String,
    pub changes: Vec<EquipmentChange>,
    pub prices: Vec<PriceRecord>,
    pub signals: Vec<SalesSignal>,
    pub candidates: usize,
    pub names_total: usize,
    pub names_matched: usize,
    pub visual_pass: bool,
    pub tokens_used: u64,
    pub degradations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteFailure {
    pub site_id: Uuid,
    pub site_name: String,
    pub stage: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryRunEstimate {
    pub sites: usize,
    pub visual_passes: usize,
    pub estimated_seconds: u64,
    pub estimated_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub cancelled: bool,
    /// succeeded + failed + skipped_no_change
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped_by_schedule: usize,
    pub skipped_no_change: usize,
    pub deferred: usize,
    pub filtered_out: usize,
    pub tier_reassignments: usize,
    pub visual_passes: usize,
    pub tokens_used: u64,
    pub names_total: usize,
    pub names_matched: usize,
    pub match_rate: f64,
    pub candidates: usize,
    pub signals: usize,
    pub degradations: usize,
    pub failures: Vec<SiteFailure>,
    pub estimate: Option<DryRunEstimate>,
    pub reports_dir: Option<String>,
}

impl BatchSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            dry_run,
            cancelled: false,
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped_by_schedule: 0,
            skipped_no_change: 0,
            deferred: 0,
            filtered_out: 0,
            tier_reassignments: 0,
            visual_passes: 0,
            tokens_used: 0,
            names_total: 0,
            names_matched: 0,
            match_rate: 0.0,
            candidates: 0,
            signals: 0,
            degradations: 0,
            failures: Vec::new(),
            estimate: None,
            reports_dir: None,
        }
    }

    fn record(&mut self, site: &TrackedSite, outcome: &SiteOutcome) {
        self.processed += 1;
        match outcome {
            SiteOutcome::Succeeded(report) => {
                self.succeeded += 1;
                self.visual_passes += usize::from(report.visual_pass);
                self.tokens_used += report.tokens_used;
                self.names_total += report.names_total;
                self.names_matched += report.names_matched;
                self.candidates += report.candidates;
                self.signals += report.signals.len();
                self.degradations += report.degradations.len();
            }
            SiteOutcome::NoChange => self.skipped_no_change += 1,
            SiteOutcome::Failed(err) => {
                self.failed += 1;
                self.failures.push(SiteFailure {
                    site_id: site.id,
                    site_name: site.name.clone(),
                    stage: err.stage().to_string(),
                    message: err.to_string(),
                });
            }
        }
        self.match_rate = ratio(self.names_matched, self.names_total);
    }
}

fn ratio(matched: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        matched as f64 / total as f64
    }
}

#[derive(Debug)]
enum SiteOutcome {
    Succeeded(Box<SiteReport>),
    NoChange,
    Failed(SiteError),
}

/// Lazily opened visual session, closed once when the batch ends.
struct VisualSession {
    backend: Option<Arc<dyn VisualBackend>>,
    session: Option<Box<dyn VisualRecognizer>>,
    unavailable: Option<String>,
}

impl VisualSession {
    fn new(backend: Option<Arc<dyn VisualBackend>>) -> Self {
        Self {
            backend,
            session: None,
            unavailable: None,
        }
    }

    fn configured(&self) -> bool {
        self.backend.is_some()
    }

    async fn recognizer(&mut self) -> Result<&dyn VisualRecognizer, SiteError> {
        if let Some(reason) = &self.unavailable {
            return Err(SiteError::VisualRecognition(reason.clone()));
        }
        if self.session.is_none() {
            let Some(backend) = &self.backend else {
                return Err(SiteError::VisualRecognition(
                    "no visual backend configured".to_string(),
                ));
            };
            match backend.open_session().await {
                Ok(session) => {
                    info!("visual session opened");
                    self.session = Some(session);
                }
                Err(err) => {
                    // Not retried for the rest of the batch.
                    let reason = format!("opening visual session: {err}");
                    self.unavailable = Some(reason.clone());
                    return Err(SiteError::VisualRecognition(reason));
                }
            }
        }
        self.session
            .as_deref()
            .ok_or_else(|| SiteError::VisualRecognition("visual session unavailable".to_string()))
    }

    async fn close(self) {
        let Some(session) = self.session else {
            return;
        };
        match session.close().await {
            Ok(()) => info!("visual session closed"),
            Err(err) => warn!(error = %err, "closing visual session failed"),
        }
    }
}

struct ExtractionContext {
    matcher: CatalogMatcher,
    decomposer: Decomposer,
    prices: PriceConfig,
    detector: ChangeDetector,
}

pub struct Pipeline {
    store: Arc<dyn Store>,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
    pacer: Pacer,
    thresholds: Thresholds,
    limits: CollectionLimits,
    pacing: (Duration, Duration),
    reports: Option<ReportWriter>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn Store>,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            pacer: Pacer::new(Duration::ZERO, Duration::ZERO, clock.clone()),
            store,
            collaborators,
            clock,
            thresholds,
            limits: CollectionLimits::default(),
            pacing: (Duration::ZERO, Duration::ZERO),
            reports: None,
        }
    }

    pub fn from_config(
        config: &PipelineConfig,
        store: Arc<dyn Store>,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        thresholds: Thresholds,
    ) -> Self {
        let pipeline = Self::new(store, collaborators, clock, thresholds)
            .with_pacing(config.pacing_delay, config.pacing_jitter)
            .with_limits(CollectionLimits {
                max_subpages: config.max_subpages,
                max_images: config.max_images,
            });
        if config.reports_enabled {
            pipeline.with_reports(ReportWriter::new(config.reports_root()))
        } else {
            pipeline
        }
    }

    pub fn with_pacing(mut self, base: Duration, jitter: Duration) -> Self {
        self.pacer = Pacer::new(base, jitter, self.clock.clone());
        self.pacing = (base, jitter);
        self
    }

    pub fn with_limits(mut self, limits: CollectionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_reports(mut self, writer: ReportWriter) -> Self {
        self.reports = Some(writer);
        self
    }

    /// Runs one batch. Only setup failures (site listing, catalog load) are errors;
    /// per-site failures are counted in the summary.
    pub async fn run_batch(&self, options: &BatchOptions, cancel: &BatchCancel) -> Result<BatchSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("batch", %run_id, dry_run = options.dry_run);
        self.run_batch_inner(run_id, options, cancel)
            .instrument(span)
            .await
    }

    async fn run_batch_inner(
        &self,
        run_id: Uuid,
        options: &BatchOptions,
        cancel: &BatchCancel,
    ) -> Result<BatchSummary> {
        let started_at = self.clock.now();
        let sites = self.store.list_sites().await.context("listing tracked sites")?;
        let plan = schedule::plan(sites, &options.filter, started_at);

        let mut summary = BatchSummary::new(run_id, started_at, options.dry_run);
        summary.skipped_by_schedule = plan.skipped_by_schedule;
        summary.deferred = plan.deferred;
        summary.filtered_out = plan.filtered_out;
        summary.tier_reassignments = plan.reassigned.len();
        info!(
            eligible = plan.eligible.len(),
            skipped_by_schedule = plan.skipped_by_schedule,
            deferred = plan.deferred,
            reassigned = plan.reassigned.len(),
            "batch planned"
        );

        if options.dry_run {
            let estimate = self
                .estimate(&plan.eligible, options.text_only, started_at)
                .await?;
            info!(?estimate, "dry run estimate");
            summary.estimate = Some(estimate);
            summary.finished_at = self.clock.now();
            return Ok(summary);
        }

        for assignment in &plan.reassigned {
            if let Err(err) = self
                .store
                .update_site_tier(assignment.site_id, assignment.to)
                .await
            {
                warn!(site_id = %assignment.site_id, error = %err, "tier reassignment not persisted");
            }
        }

        let catalog = self.store.catalog().await.context("loading catalog")?;
        self.collaborators
            .analyzer
            .refresh_catalog(&catalog)
            .context("refreshing analyzer vocabulary")?;
        let matcher_config = self.thresholds.matcher_config();
        let ctx = ExtractionContext {
            matcher: CatalogMatcher::new(&catalog, matcher_config),
            decomposer: Decomposer::new(&catalog, matcher_config.min_contained_keyword_chars),
            prices: self.thresholds.price_config(),
            detector: ChangeDetector::new(self.thresholds.visual_interval_days),
        };

        let mut visual = VisualSession::new(self.collaborators.visual.clone());
        let mut reports = Vec::new();
        for (index, site) in plan.eligible.iter().enumerate() {
            if index > 0 {
                self.pacer.pause(run_id, &site.id.to_string()).await;
            }
            if cancel.is_cancelled() {
                warn!(remaining = plan.eligible.len() - index, "batch cancelled between sites");
                summary.cancelled = true;
                break;
            }

            let span = info_span!("site_run", %run_id, site_id = %site.id, site = %site.name);
            let outcome = self
                .run_site(run_id, site, &ctx, options, &mut visual)
                .instrument(span)
                .await;
            self.finish_site(run_id, site, &outcome).await;
            summary.record(site, &outcome);
            if let SiteOutcome::Succeeded(report) = outcome {
                reports.push(*report);
            }
        }
        visual.close().await;

        summary.finished_at = self.clock.now();
        if let Some(writer) = &self.reports {
            match writer.write(&summary, &reports).await {
                Ok(dir) => summary.reports_dir = Some(dir.display().to_string()),
                Err(err) => warn!(error = %err, "writing run reports failed"),
            }
        }
        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped_by_schedule = summary.skipped_by_schedule,
            skipped_no_change = summary.skipped_no_change,
            match_rate = summary.match_rate,
            signals = summary.signals,
            "batch finished"
        );
        Ok(summary)
    }

    async fn estimate(
        &self,
        sites: &[TrackedSite],
        text_only: bool,
        now: DateTime<Utc>,
    ) -> Result<DryRunEstimate> {
        let detector = ChangeDetector::new(self.thresholds.visual_interval_days);
        let mut visual_passes = 0;
        if self.collaborators.visual.is_some() {
            for site in sites {
                let previous = self
                    .store
                    .latest_snapshot(site.id)
                    .await
                    .with_context(|| format!("reading latest snapshot of {}", site.id))?;
                let last_visual = previous.and_then(|p| p.visual_pass_at);
                if detector.visual_due(last_visual, site.tier, text_only, now) {
                    visual_passes += 1;
                }
            }
        }

        let (base, jitter) = self.pacing;
        let gaps = sites.len().saturating_sub(1) as u64;
        let pacing_ms = gaps * (base.as_millis() as u64 + jitter.as_millis() as u64 / 2);
        Ok(DryRunEstimate {
            sites: sites.len(),
            visual_passes,
            estimated_seconds: sites.len() as u64 * self.thresholds.estimated_seconds_per_site
                + pacing_ms / 1_000,
            estimated_tokens: visual_passes as u64 * self.thresholds.estimated_tokens_per_visual_pass,
        })
    }

    async fn run_site(
        &self,
        run_id: Uuid,
        site: &TrackedSite,
        ctx: &ExtractionContext,
        options: &BatchOptions,
        visual: &mut VisualSession,
    ) -> SiteOutcome {
        match self.process_site(run_id, site, ctx, options, visual).await {
            Ok(Some(report)) => SiteOutcome::Succeeded(Box::new(report)),
            Ok(None) => {
                info!("content unchanged; skipping extraction");
                SiteOutcome::NoChange
            }
            Err(err) => {
                warn!(stage = err.stage(), error = %err, "site run failed");
                SiteOutcome::Failed(err)
            }
        }
    }

    /// Last-crawl bookkeeping and the activity entry, after every attempt.
    async fn finish_site(&self, run_id: Uuid, site: &TrackedSite, outcome: &SiteOutcome) {
        let at = self.clock.now();
        if let Err(err) = self.store.mark_crawled(site.id, at).await {
            warn!(site_id = %site.id, error = %err, "last-crawl timestamp not updated");
        }
        let (stage, outcome, message) = match outcome {
            SiteOutcome::Succeeded(report) => (
                "done",
                ActivityOutcome::Succeeded,
                Some(report.diff_summary.clone()),
            ),
            SiteOutcome::NoChange => ("collecting", ActivityOutcome::NoChange, None),
            SiteOutcome::Failed(err) => (err.stage(), ActivityOutcome::Failed, Some(err.to_string())),
        };
        let entry = ActivityEntry {
            id: Uuid::new_v4(),
            site_id: site.id,
            run_id,
            stage: stage.to_string(),
            outcome,
            message,
            at,
        };
        if let Err(err) = self.store.record_activity(&entry).await {
            warn!(site_id = %site.id, error = %err, "activity entry not recorded");
        }
    }

    async fn process_site(
        &self,
        run_id: Uuid,
        site: &TrackedSite,
        ctx: &ExtractionContext,
        options: &BatchOptions,
        visual: &mut VisualSession,
    ) -> Result<Option<SiteReport>, SiteError> {
        let now = self.clock.now();
        let collector = &self.collaborators.collector;
        let previous = self.store.latest_snapshot(site.id).await?;

        let primary = collector
            .fetch(&site.url)
            .await
            .map_err(|err| SiteError::Collection {
                url: site.url.clone(),
                reason: err.to_string(),
            })?
            .ok_or_else(|| SiteError::Collection {
                url: site.url.clone(),
                reason: "no content returned".to_string(),
            })?;

        let mut degradations = Vec::new();
        let subpages = collector.find_subpages(&primary, &site.url);
        let mut pages = vec![primary];
        for subpage in subpages.into_iter().take(self.limits.max_subpages) {
            match collector.fetch(&subpage.url).await {
                Ok(Some(raw)) => pages.push(raw),
                Ok(None) => debug!(url = %subpage.url, "subpage returned no content"),
                Err(err) => {
                    let err = SiteError::Subpage {
                        url: subpage.url.clone(),
                        reason: err.to_string(),
                    };
                    warn!(stage = err.stage(), error = %err, "continuing without subpage");
                    degradations.push(err.to_string());
                }
            }
        }

        let text = pages
            .iter()
            .map(|page| html_to_text(&page.html))
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        let text_hash = detect::text_hash(&text);
        let decision =
            ctx.detector
                .decide(previous.as_ref(), &text_hash, site.tier, options.text_only, now);
        debug!(decision = decision.as_str(), %text_hash, pages = pages.len(), "change decision");
        if !decision.proceeds() {
            return Ok(None);
        }

        let analysis = self
            .collaborators
            .analyzer
            .analyze(&text)
            .await
            .map_err(SiteError::Recognition)?;
        let mut equipment_raw = analysis.equipments;
        let mut treatment_raw = analysis.treatments;

        let mut fresh_visual = None;
        let mut tokens_used = 0;
        if decision.visual_pass() && visual.configured() {
            match self.visual_pass(&pages, visual).await {
                Ok(Some(recognition)) => {
                    tokens_used = recognition.tokens_used;
                    let hash = detect::ocr_hash(
                        recognition
                            .equipment_names
                            .iter()
                            .chain(recognition.treatment_names.iter())
                            .map(String::as_str),
                    );
                    fresh_visual = Some((hash, now));
                    equipment_raw.extend(recognition.equipment_names);
                    treatment_raw.extend(recognition.treatment_names);
                }
                Ok(None) => debug!("no images available for a visual pass"),
                Err(err) => {
                    warn!(stage = err.stage(), error = %err, "degrading to text-only results");
                    degradations.push(err.to_string());
                }
            }
        }

        let equipment_report = ctx
            .matcher
            .match_all(ItemKind::Equipment, &unique_names(equipment_raw));
        let treatment_report = ctx
            .matcher
            .match_all(ItemKind::Treatment, &unique_names(treatment_raw));
        let names_total = equipment_report.total() + treatment_report.total();
        let names_matched = equipment_report.matched() + treatment_report.matched();

        let mut candidates = ctx.decomposer.candidates(
            ItemKind::Equipment,
            equipment_report.unresolved(),
            site.id,
            run_id,
            now,
        );
        candidates.extend(ctx.decomposer.candidates(
            ItemKind::Treatment,
            treatment_report.unresolved(),
            site.id,
            run_id,
            now,
        ));

        let mut prices = extract_prices(&text, now.date_naive(), &ctx.prices);
        attach_canonical_names(&mut prices, &ctx.matcher);

        let equipment = equipment_report.display_names();
        let treatments = treatment_report.display_names();
        let visual_changed = match (&fresh_visual, previous.as_ref()) {
            (Some((hash, _)), Some(prev)) => prev.ocr_hash.as_ref().is_some_and(|p| p != hash),
            _ => false,
        };
        let diff = SnapshotDiff::compute(
            previous.as_ref(),
            &equipment,
            &treatments,
            &prices,
            visual_changed,
        );
        let visual_ran = fresh_visual.is_some();
        let (ocr_hash, visual_pass_at) = carry_visual_state(previous.as_ref(), fresh_visual);

        let snapshot_id = Uuid::new_v4();
        let changes = diff.equipment_changes(site.id, snapshot_id, now, |item| {
            equipment_report.category_of(item).map(str::to_string)
        });
        let (regular, events) = partition_event_prices(prices.clone());
        let write = RunWrite {
            snapshot: Snapshot {
                id: snapshot_id,
                site_id: site.id,
                run_id,
                text_hash,
                ocr_hash,
                visual_pass_at,
                equipment,
                treatments,
                prices: regular,
                event_prices: events,
                match_rate: ratio(names_matched, names_total),
                diff_summary: diff.summary(),
                created_at: now,
            },
            changes,
            candidates,
        };
        self.store.persist_run(&write).await?;
        info!(
            decision = decision.as_str(),
            changes = write.changes.len(),
            prices = prices.len(),
            candidates = write.candidates.len(),
            summary = %write.snapshot.diff_summary,
            "snapshot stored"
        );

        let signals = match self.classify(site, &write.changes, now).await {
            Ok(signals) => signals,
            Err(err) => {
                warn!(stage = err.stage(), error = %err, "run kept without signals");
                degradations.push(err.to_string());
                Vec::new()
            }
        };

        Ok(Some(SiteReport {
            site_id: site.id,
            site_name: site.name.clone(),
            snapshot_id,
            decision,
            diff_summary: write.snapshot.diff_summary,
            changes: write.changes,
            prices,
            signals,
            candidates: write.candidates.len(),
            names_total,
            names_matched,
            visual_pass: visual_ran,
            tokens_used,
            degradations,
        }))
    }

    async fn visual_pass(
        &self,
        pages: &[RawContent],
        visual: &mut VisualSession,
    ) -> Result<Option<VisualRecognition>, SiteError> {
        let collector = &self.collaborators.collector;
        let mut urls: Vec<String> = Vec::new();
        for page in pages {
            for url in collector.extract_images(page, &page.url) {
                if !urls.contains(&url) {
                    urls.push(url);
                }
            }
        }
        if urls.is_empty() {
            return Ok(None);
        }
        let inputs = collector
            .download_images(&urls, self.limits.max_images)
            .await;
        if inputs.is_empty() {
            return Ok(None);
        }
        let recognizer = visual.recognizer().await?;
        recognizer
            .recognize(&inputs)
            .await
            .map(Some)
            .map_err(|err| SiteError::VisualRecognition(err.to_string()))
    }

    async fn classify(
        &self,
        site: &TrackedSite,
        changes: &[EquipmentChange],
        at: DateTime<Utc>,
    ) -> Result<Vec<SalesSignal>, SiteError> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }
        let failed = |err: StoreError| SiteError::Classification(err.to_string());
        let mut products = Vec::new();
        for product in self.store.active_products().await.map_err(failed)? {
            let rules = self
                .store
                .rules_for_product(product.id)
                .await
                .map_err(failed)?;
            products.push(ProductRules { product, rules });
        }
        let signals = signals::classify(&products, changes, site, at);
        if !signals.is_empty() {
            self.store.insert_signals(&signals).await.map_err(failed)?;
        }
        Ok(signals)
    }
}

/// Trimmed, case-insensitively unique names in first-seen order.
fn unique_names(names: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty() && seen.insert(fold_case(n)))
        .collect()
}
