use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use padron_storage::SyncLease;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{SyncConfig, SyncEngine, SyncError, SyncRequest, SyncRunSummary};

/// Lease name shared by every node running the sync.
pub const SYNC_LEASE: &str = "padron-sync";

/// Runs the engine only if this process can take the cluster-wide lease; released afterwards
/// whether the run succeeded or not. A crashed holder blocks others for at most `ttl`.
pub async fn run_exclusive(
    engine: &SyncEngine,
    lease: &dyn SyncLease,
    ttl: Duration,
    request: &SyncRequest,
) -> Result<SyncRunSummary, SyncError> {
    let holder = format!("pid-{}-{}", std::process::id(), Uuid::new_v4());
    if !lease.try_acquire_lease(SYNC_LEASE, &holder, ttl).await? {
        return Err(SyncError::AlreadyRunning);
    }

    let outcome = engine.run(request).await;
    if let Err(err) = lease.release_lease(SYNC_LEASE, &holder).await {
        warn!(error = %err, "failed to release sync lease; it expires on its own");
    }
    outcome
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    engine: Arc<SyncEngine>,
    lease: Arc<dyn SyncLease>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let ttl = config.lock_ttl;
    let request = SyncRequest::incremental(config.page_size);
    let job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _l| {
        let engine = engine.clone();
        let lease = lease.clone();
        let request = request.clone();
        Box::pin(async move {
            match run_exclusive(&engine, lease.as_ref(), ttl, &request).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    upserted = summary.rows_upserted(),
                    watermark = %summary.final_watermark,
                    "scheduled sync finished"
                ),
                Err(SyncError::AlreadyRunning) => {
                    warn!("scheduled sync skipped, another run holds the lease")
                }
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.sync_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
