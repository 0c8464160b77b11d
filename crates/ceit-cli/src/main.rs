use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use ceit_core::Tier;
use ceit_storage::{PgStore, Store};
use ceit_sync::{BatchCancel, BatchOptions, BatchSummary, PipelineConfig, SiteFilter};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ceit-cli")]
#[command(about = "Clinic equipment intelligence batch driver")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one batch over the eligible sites.
    Run(RunArgs),
    /// Apply Postgres migrations.
    Migrate,
    /// Run batches on CEIT_BATCH_CRON until Ctrl-C.
    Schedule(RunArgs),
}

#[derive(Debug, Clone, Default, Args)]
struct RunArgs {
    /// Maximum number of eligible sites to process.
    #[arg(long)]
    limit: Option<usize>,
    /// Eligible sites to skip before processing.
    #[arg(long, default_value_t = 0)]
    offset: usize,
    /// Restrict to one tier (tier1, tier2, tier3).
    #[arg(long)]
    tier: Option<Tier>,
    /// Restrict by acquisition channel.
    #[arg(long)]
    source: Option<String>,
    /// Skip the visual recognition stage.
    #[arg(long)]
    text_only: bool,
    /// Estimate time and cost without collecting or writing anything.
    #[arg(long)]
    dry_run: bool,
}

impl RunArgs {
    fn options(&self) -> BatchOptions {
        BatchOptions {
            filter: SiteFilter {
                tier: self.tier,
                source: self.source.clone(),
                offset: self.offset,
                limit: self.limit,
            },
            text_only: self.text_only,
            dry_run: self.dry_run,
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ceit_sync=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Ctrl-C flips the flag; the running batch stops before its next site.
fn cancel_on_ctrl_c() -> BatchCancel {
    let cancel = BatchCancel::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current site");
            handle.cancel();
        }
    });
    cancel
}

async fn connect(config: &PipelineConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(store))
}

fn print_summary(summary: &BatchSummary) {
    if let Some(estimate) = &summary.estimate {
        println!(
            "dry run: run_id={} sites={} visual_passes={} est_seconds={} est_tokens={} skipped_by_schedule={}",
            summary.run_id,
            estimate.sites,
            estimate.visual_passes,
            estimate.estimated_seconds,
            estimate.estimated_tokens,
            summary.skipped_by_schedule,
        );
        return;
    }
    println!(
        "batch complete: run_id={} processed={} succeeded={} failed={} skipped_by_schedule={} skipped_no_change={} signals={} match_rate={:.2}{}",
        summary.run_id,
        summary.processed,
        summary.succeeded,
        summary.failed,
        summary.skipped_by_schedule,
        summary.skipped_no_change,
        summary.signals,
        summary.match_rate,
        if summary.cancelled { " (cancelled)" } else { "" },
    );
    for failure in &summary.failures {
        println!("  failed {} [{}]: {}", failure.site_name, failure.stage, failure.message);
    }
    if let Some(dir) = &summary.reports_dir {
        println!("reports: {dir}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli
        .command
        .unwrap_or_else(|| Commands::Run(RunArgs::default()))
    {
        Commands::Run(args) => {
            let store: Arc<dyn Store> = connect(&config).await?;
            let pipeline = ceit_sync::http_pipeline(&config, store).await?;
            let cancel = cancel_on_ctrl_c();
            let summary = pipeline.run_batch(&args.options(), &cancel).await?;
            print_summary(&summary);
        }
        Commands::Migrate => {
            connect(&config)
                .await?
                .migrate()
                .await
                .context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule(args) => {
            ensure!(
                config.scheduler_enabled,
                "scheduler disabled; set CEIT_SCHEDULER_ENABLED=true"
            );
            let store: Arc<dyn Store> = connect(&config).await?;
            let pipeline = Arc::new(ceit_sync::http_pipeline(&config, store).await?);
            let cancel = BatchCancel::new();
            let mut scheduler = ceit_sync::cron::build_scheduler(
                pipeline,
                &config.batch_cron,
                args.options(),
                cancel.clone(),
            )
            .await?;
            scheduler.start().await.context("starting scheduler")?;
            info!(cron = %config.batch_cron, "scheduler started");

            tokio::signal::ctrl_c()
                .await
                .context("waiting for interrupt")?;
            warn!("interrupt received; shutting down scheduler");
            cancel.cancel();
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
