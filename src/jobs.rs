use crate::errors::DocError;
use crate::rate_limit;
use crate::settings::RateLimit;
use crate::storage;
use sea_orm::DatabaseConnection;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Housekeeping that runs outside request handling: expired sessions and
/// stale rate-limit windows.
pub async fn init_scheduler(
    db: DatabaseConnection,
    limits: RateLimit,
) -> Result<JobScheduler, DocError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| DocError::Other(format!("Failed to create job scheduler: {}", e)))?;

    // Hourly, on the hour
    let housekeeping = Job::new_async("0 0 * * * *", move |_uuid, _l| {
        let db = db.clone();
        let limits = limits.clone();
        Box::pin(async move {
            run_housekeeping(&db, &limits).await;
        })
    })
    .map_err(|e| DocError::Other(format!("Failed to create housekeeping job: {}", e)))?;

    sched
        .add(housekeeping)
        .await
        .map_err(|e| DocError::Other(format!("Failed to add housekeeping job: {}", e)))?;

    sched
        .start()
        .await
        .map_err(|e| DocError::Other(format!("Failed to start job scheduler: {}", e)))?;

    info!("Job scheduler started");
    Ok(sched)
}

/// One housekeeping pass. Failures are logged; the next run retries.
pub async fn run_housekeeping(db: &DatabaseConnection, limits: &RateLimit) {
    match storage::cleanup_expired_sessions(db).await {
        Ok(count) => info!(count, "cleaned up expired sessions"),
        Err(e) => error!(error = %e, "failed to clean up expired sessions"),
    }

    let longest_window = limits.login_window_secs.max(limits.upload_window_secs);
    match rate_limit::prune_stale_windows(db, longest_window).await {
        Ok(count) => info!(count, "pruned stale rate limit windows"),
        Err(e) => error!(error = %e, "failed to prune rate limit windows"),
    }
}
