use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::config::Config;
use crate::error::Result;
use crate::functions::deliver::DeliveryExecutor;
use crate::services::JobQueue;

/// One pass over the durable queue: claim due jobs, run each through the
/// executor, settle the job. Failures retry with exponential backoff
/// until the attempt budget is spent.
pub async fn worker_tick(
    queue: &Arc<dyn JobQueue>,
    executor: &Arc<DeliveryExecutor>,
    batch: i64,
    now: DateTime<Utc>,
) -> Result<u32> {
    let jobs = queue.claim_due(now, batch).await?;
    if jobs.is_empty() {
        return Ok(0);
    }

    tracing::debug!(count = jobs.len(), "worker: processing due jobs");

    let mut processed = 0u32;
    for job in jobs {
        let final_attempt = job.attempts >= job.max_attempts;
        match executor
            .deliver(job.schedule_id, job.company_id, final_attempt)
            .await
        {
            Ok(()) => queue.complete(job.id).await?,
            Err(err) => {
                let retry_at = (!final_attempt).then(|| now + job.backoff_delay());
                if let Some(retry_at) = &retry_at {
                    tracing::info!(
                        job_id = %job.id,
                        schedule_id = %job.schedule_id,
                        attempt = job.attempts,
                        retry_at = %retry_at,
                        "worker: delivery failed, retrying"
                    );
                } else {
                    tracing::warn!(
                        job_id = %job.id,
                        schedule_id = %job.schedule_id,
                        attempt = job.attempts,
                        "worker: delivery failed, attempts exhausted"
                    );
                }
                queue.fail(job.id, &err.to_string(), retry_at).await?;
            }
        }
        processed += 1;
    }

    Ok(processed)
}

pub async fn worker(
    queue: Arc<dyn JobQueue>,
    executor: Arc<DeliveryExecutor>,
    config: Arc<Config>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(config.worker_poll) => {
                match worker_tick(&queue, &executor, config.worker_batch, Utc::now()).await {
                    Ok(n) if n > 0 => tracing::info!(processed = n, "worker tick"),
                    Err(e) => tracing::error!(error = %e, "worker tick failed"),
                    _ => {}
                }
            }
        }
    }
}
