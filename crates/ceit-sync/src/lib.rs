//! Batch orchestration for CEIT: tier scheduling, change detection, snapshot diffs,
//! sales-signal classification, reports and cron triggering.

use std::sync::Arc;

use anyhow::{Context, Result};
use ceit_adapters::{HttpCollector, KeywordContentAnalyzer};
use ceit_storage::{HttpFetcher, Store, SystemClock};

pub mod config;
pub mod cron;
pub mod detect;
pub mod pipeline;
pub mod report;
pub mod schedule;
pub mod signals;
pub mod snapshot;

pub use config::{PipelineConfig, Thresholds, VisualIntervals};
pub use detect::{ChangeDecision, ChangeDetector};
pub use pipeline::{
    BatchCancel, BatchOptions, BatchSummary, Collaborators, CollectionLimits, DryRunEstimate,
    Pipeline, SiteError, SiteFailure, SiteReport,
};
pub use report::ReportWriter;
pub use schedule::{SchedulePlan, SiteFilter};
pub use snapshot::SnapshotDiff;

pub const CRATE_NAME: &str = "ceit-sync";

/// Pipeline over HTTP collection and catalog-keyword analysis, configured from
/// `config` and the workspace thresholds file. No visual backend is attached.
pub async fn http_pipeline(config: &PipelineConfig, store: Arc<dyn Store>) -> Result<Pipeline> {
    let thresholds = Thresholds::load(&config.workspace_root).await?;
    let catalog = store
        .catalog()
        .await
        .context("loading catalog for content analysis")?;
    let fetcher = HttpFetcher::new(config.http_client_config()).context("building http client")?;
    let analyzer = KeywordContentAnalyzer::new(&catalog).context("building content analyzer")?;
    let collaborators = Collaborators {
        collector: Arc::new(HttpCollector::new(fetcher)),
        analyzer: Arc::new(analyzer),
        visual: None,
    };
    Ok(Pipeline::from_config(
        config,
        store,
        collaborators,
        Arc::new(SystemClock),
        thresholds,
    ))
}
