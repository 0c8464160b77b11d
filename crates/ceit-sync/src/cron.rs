use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::pipeline::{BatchCancel, BatchOptions, Pipeline};

/// Scheduler that runs one batch per cron trigger. A trigger that fires while the
/// previous batch is still running is dropped.
pub async fn build_scheduler(
    pipeline: Arc<Pipeline>,
    cron: &str,
    options: BatchOptions,
    cancel: BatchCancel,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let running = Arc::new(Mutex::new(()));

    let job = Job::new_async(cron, move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        let options = options.clone();
        let cancel = cancel.clone();
        let running = running.clone();
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous batch still running; trigger skipped");
                return;
            };
            if cancel.is_cancelled() {
                return;
            }
            match pipeline.run_batch(&options, &cancel).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    processed = summary.processed,
                    failed = summary.failed,
                    "scheduled batch finished"
                ),
                Err(err) => warn!(error = %err, "scheduled batch could not start"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
