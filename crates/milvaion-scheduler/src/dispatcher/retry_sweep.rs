//! Dispatch-retry sweep (§4.5 step 11): picks up `Queued` occurrences
//! whose publish attempt previously failed and whose backoff has
//! elapsed, and retries them through the same publish/exhaustion path
//! the main iteration uses.

use super::Dispatcher;
use crate::metrics::DispatcherMetrics;
use chrono::Utc;
use milvaion_core::MilvaionResult;
use milvaion_resilience::RetryPolicy;
use tracing::warn;

impl Dispatcher {
    pub(super) async fn run_retry_sweep(&self) -> MilvaionResult<usize> {
        let now = Utc::now();
        let max_attempts = RetryPolicy::dispatch_sweep().max_attempts;
        let pending = self.store.find_pending_dispatch_retries(now, max_attempts).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        DispatcherMetrics::retry_sweep_picked_up(pending.len() as u64);

        let ids: Vec<_> = pending.iter().map(|occ| occ.job_id).collect();
        let jobs = self.resolve_jobs(&ids).await?;

        let mut republished = 0;
        for occurrence in pending {
            let Some(job) = jobs.iter().find(|j| j.id == occurrence.job_id) else {
                warn!(job_id = %occurrence.job_id, occurrence_id = %occurrence.id, "retry sweep could not resolve job, skipping");
                continue;
            };
            if self.publish_one(job.clone(), occurrence).await {
                republished += 1;
            }
        }
        Ok(republished)
    }
}
