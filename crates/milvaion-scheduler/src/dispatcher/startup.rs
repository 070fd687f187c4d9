//! Start-up recovery (§4.5 "Start-up recovery"): makes a freshly started
//! dispatcher safe to run even if the Redis time index is empty (cold
//! cache) or the previous instance crashed mid-flight.

use super::Dispatcher;
use chrono::{DateTime, Utc};
use milvaion_core::MilvaionResult;
use std::collections::HashSet;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Occurrences still `Queued`/`Running` from before this grace period are
/// presumed orphaned by the restart rather than legitimately in flight.
const STARTUP_GRACE_PERIOD: chrono::Duration = chrono::Duration::minutes(2);

const HEALTH_CHECK_RETRY_INTERVAL: Duration = Duration::from_secs(2);

impl Dispatcher {
    /// Runs the four start-up recovery steps in order (§4.5): wait for the
    /// store, reconcile the index against durable state, the grace-period
    /// zombie sweep, then repopulate. Running this twice back to back is a
    /// no-op on durable state (§8 property 9): reconcile only removes what
    /// repopulate would not have re-added anyway, and repopulate's reseed
    /// check is itself idempotent.
    pub(super) async fn startup_recovery(&self, cancellation: &CancellationToken) -> MilvaionResult<()> {
        self.wait_for_store(cancellation).await;

        let active_jobs = self.store.list_active_jobs().await?;
        self.reconcile_time_index(&active_jobs).await?;

        let cutoff = Utc::now() - STARTUP_GRACE_PERIOD;
        let failed = self.store.fail_stale_occurrences_on_startup(cutoff).await?;
        if failed > 0 {
            warn!(failed, "start-up recovery: marked pre-restart occurrences as failed");
        }

        info!(count = active_jobs.len(), "start-up recovery: repopulating time index");
        for job in &active_jobs {
            let scheduled = self.scheduler_client.get_scheduled_time(job.id).await?;
            if needs_reseed(scheduled, job.execute_at) {
                warn!(job_id = %job.id, "job missing or stale in Redis time index, reseeding from store");
                self.scheduler_client.add_to_scheduled_set(job.id, job.execute_at).await?;
            }
            self.scheduler_client.cache_job_details(job).await?;
        }

        info!("start-up recovery complete");
        Ok(())
    }

    /// Start-up recovery step 2: removes time-index entries for ids that
    /// are no longer present (or no longer active) in the store — a job
    /// soft-deleted or disabled while this dispatcher was down otherwise
    /// keeps firing forever on a stale index entry.
    async fn reconcile_time_index(&self, active_jobs: &[milvaion_core::ScheduledJob]) -> MilvaionResult<()> {
        let indexed = self.scheduler_client.get_all_scheduled_job_ids().await?;
        if indexed.is_empty() {
            return Ok(());
        }
        let active_ids: HashSet<_> = active_jobs.iter().map(|job| job.id).collect();

        for job_id in indexed {
            if !active_ids.contains(&job_id) {
                warn!(job_id = %job_id, "time index entry has no active store row, removing");
                self.scheduler_client.remove_from_scheduled_set(job_id).await?;
                self.scheduler_client.remove_cached_job(job_id).await?;
            }
        }
        Ok(())
    }

    /// Blocks (respecting cancellation) until the store answers a health
    /// check, so the first real iteration never runs against a database
    /// that is still coming up alongside the dispatcher in the same
    /// deployment.
    async fn wait_for_store(&self, cancellation: &CancellationToken) {
        loop {
            match self.store.health_check().await {
                Ok(()) => return,
                Err(e) => {
                    warn!(error = %e, "store not yet reachable, retrying");
                    tokio::select! {
                        () = cancellation.cancelled() => return,
                        () = sleep(HEALTH_CHECK_RETRY_INTERVAL) => {}
                    }
                }
            }
        }
    }
}

/// Start-up recovery step 4's reseed decision for one active job: reseed
/// when the time-index entry is missing entirely, or when its score has
/// drifted from the store's `executeAt` (e.g. a reschedule that landed in
/// the store but lost the race with a restart).
fn needs_reseed(scheduled: Option<DateTime<Utc>>, execute_at: DateTime<Utc>) -> bool {
    scheduled != Some(execute_at)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_index_entry_needs_reseed() {
        assert!(needs_reseed(None, Utc::now()));
    }

    #[test]
    fn matching_score_does_not_need_reseed() {
        let at = Utc::now();
        assert!(!needs_reseed(Some(at), at));
    }

    #[test]
    fn drifted_score_needs_reseed() {
        let at = Utc::now();
        let stale = at - chrono::Duration::minutes(5);
        assert!(needs_reseed(Some(stale), at));
    }
}
