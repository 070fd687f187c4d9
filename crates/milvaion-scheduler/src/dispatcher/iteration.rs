//! The main per-tick dispatch flow (§4.5): due-job lookup, job projection
//! resolution, concurrency/worker-capacity gating, bulk persistence with
//! phantom-job recovery, and the bounded-parallelism publish step. The
//! per-job lock is acquired during the publish step, not during gating —
//! losing the race there still leaves a persisted `Failed` occurrence
//! rather than silently dropping the attempt (§8 property, §7 error table:
//! "Lock contention ... Mark the occurrence Failed").

use super::Dispatcher;
use crate::bus::DispatchEnvelope;
use crate::cron;
use crate::metrics::DispatcherMetrics;
use crate::redis::CachedJob;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use milvaion_core::{
    ConcurrencyPolicy, FailedOccurrence, FailureType, JobId, JobOccurrence, MilvaionError,
    MilvaionResult, OccurrenceStatus,
};
use milvaion_resilience::RetryPolicy;
use std::collections::HashSet;
use std::time::Duration as StdDuration;
use tracing::{error, warn};

impl Dispatcher {
    pub(super) async fn run_iteration(&self) -> MilvaionResult<usize> {
        if self.scheduler_client.is_emergency_stopped().await? {
            DispatcherMetrics::skipped("emergency_stop");
            return Ok(0);
        }

        let now = Utc::now();
        let due_ids = self
            .scheduler_client
            .get_due_jobs(now, self.config.max_batch_size as usize)
            .await?;
        if due_ids.is_empty() {
            return Ok(0);
        }
        DispatcherMetrics::due_jobs_observed(due_ids.len() as u64);

        let jobs = self.resolve_jobs(&due_ids).await?;
        let running_ids: HashSet<JobId> = self
            .scheduler_client
            .get_running_job_ids(&due_ids)
            .await?
            .into_iter()
            .collect();

        let mut candidates = Vec::new();
        for job in jobs {
            let gate_ok = if job.is_active {
                self.passes_concurrency_gate(&job, running_ids.contains(&job.id)).await
            } else {
                false
            };

            let capacity_ok = if job.is_active && gate_ok {
                match &job.worker_id {
                    Some(worker_id) => self.worker_capacity_ok(worker_id, &job).await,
                    None => true,
                }
            } else {
                true
            };

            match route_due_job(job.is_active, gate_ok, capacity_ok) {
                DueJobRoute::RemoveFromIndex => {
                    if let Err(e) = self.scheduler_client.remove_from_scheduled_set(job.id).await {
                        warn!(job_id = %job.id, error = %e, "failed to remove inactive job from time index");
                    }
                }
                DueJobRoute::LeaveDue => {}
                DueJobRoute::Reschedule => {
                    DispatcherMetrics::skipped("worker_at_capacity");
                    self.reschedule(&job, now).await;
                }
                DueJobRoute::Eligible => {
                    let occurrence = JobOccurrence::new_queued(job.id, job.job_name_in_worker.clone(), job.version);
                    candidates.push((job, occurrence));
                }
            }
        }

        if candidates.is_empty() {
            return Ok(0);
        }

        let persisted = self.persist_occurrences(candidates).await?;
        if persisted.is_empty() {
            return Ok(0);
        }

        let created_ids: Vec<String> = persisted.iter().map(|(_, occ)| occ.id.to_string()).collect();
        self.publisher.publish_event("occurrences.created", &created_ids).await;

        Ok(self.publish_bounded(persisted, now).await)
    }

    /// §4.5 step 6's concurrency-policy gate. `Queue` jobs are always
    /// eligible; `Skip` jobs are blocked either by an already-`Running`
    /// occurrence or, if none is running yet, by a non-empty backlog on the
    /// worker's own consumer queue (a second dispatch would just pile up
    /// behind one the worker hasn't even picked up yet).
    async fn passes_concurrency_gate(&self, job: &CachedJob, already_running: bool) -> bool {
        if job.concurrent_execution_policy != ConcurrencyPolicy::Skip {
            return true;
        }
        if already_running {
            DispatcherMetrics::skipped("already_running");
            return false;
        }
        let depth = self.publisher.queue_depth(&job.job_name_in_worker).await;
        if let Err(e) = &depth {
            warn!(job_id = %job.id, error = %e, "failed to inspect queue depth, proceeding as if empty");
        }
        let clear = queue_is_clear(depth);
        if !clear {
            DispatcherMetrics::skipped("queue_backlog");
        }
        clear
    }

    /// §4.5 step 6's worker-capacity gate: the worker group must be active
    /// (a live heartbeat within the configured timeout), and neither its
    /// group-wide nor its per-consumer job count may be at an (optional)
    /// configured bound.
    async fn worker_capacity_ok(&self, worker_id: &str, job: &CachedJob) -> bool {
        let ttl = self.worker_health.heartbeat_timeout();
        match self.worker_registry.is_worker_active(worker_id, ttl).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                warn!(worker_id, error = %e, "failed to check worker activity, skipping this tick");
                return false;
            }
        }

        if let Ok((current, Some(max))) = self.worker_registry.get_worker_capacity(worker_id).await {
            if current >= max {
                return false;
            }
        }
        if let Ok((current, Some(max))) =
            self.worker_registry.get_consumer_capacity(worker_id, &job.job_name_in_worker).await
        {
            if current >= max {
                return false;
            }
        }
        true
    }

    /// Resolves `ids` to dispatch-sufficient projections, filling cache
    /// misses from the store and re-caching them (§4.5 step 3).
    pub(super) async fn resolve_jobs(&self, ids: &[JobId]) -> MilvaionResult<Vec<CachedJob>> {
        let mut cached = self.scheduler_client.get_cached_jobs_bulk(ids).await?;
        let missing: Vec<JobId> = ids.iter().copied().filter(|id| !cached.contains_key(id)).collect();

        if !missing.is_empty() {
            let loaded = self.store.get_jobs_bulk(&missing).await?;
            for job in &loaded {
                if let Err(e) = self.scheduler_client.cache_job_details(job).await {
                    warn!(job_id = %job.id, error = %e, "failed to cache job after store fallback");
                }
                cached.insert(job.id, CachedJob::from(job));
            }
            let found: HashSet<JobId> = loaded.iter().map(|j| j.id).collect();
            for id in &missing {
                if !found.contains(id) {
                    warn!(job_id = %id, "due job id has no matching store row, removing from time index");
                    if let Err(e) = self.scheduler_client.remove_from_scheduled_set(*id).await {
                        warn!(job_id = %id, error = %e, "failed to drop stale time-index entry");
                    }
                }
            }
        }

        Ok(ids.iter().filter_map(|id| cached.get(id).cloned()).collect())
    }

    /// Computes the job's next fire time and updates the Redis time index
    /// accordingly: a cron job gets its next occurrence re-added, a
    /// one-time job (no cron expression) is removed so it never fires
    /// twice, and an unparsable expression is dropped rather than retried
    /// every tick.
    pub(super) async fn reschedule(&self, job: &CachedJob, from: DateTime<Utc>) {
        let Some(expression) = &job.cron_expression else {
            if let Err(e) = self.scheduler_client.remove_from_scheduled_set(job.id).await {
                warn!(job_id = %job.id, error = %e, "failed to remove one-time job from time index");
            }
            return;
        };

        match cron::next_fire_time(expression, from) {
            Ok(Some(next)) => {
                if let Err(e) = self.scheduler_client.add_to_scheduled_set(job.id, next).await {
                    warn!(job_id = %job.id, error = %e, "failed to reschedule job");
                }
            }
            Ok(None) => {
                warn!(job_id = %job.id, expression, "cron expression has no future occurrence, removing from index");
                let _ = self.scheduler_client.remove_from_scheduled_set(job.id).await;
            }
            Err(e) => {
                error!(job_id = %job.id, expression, error = %e, "invalid cron expression, removing from index");
                let _ = self.scheduler_client.remove_from_scheduled_set(job.id).await;
            }
        }
    }

    /// Bulk-inserts the new occurrences, recovering from a foreign-key
    /// violation (a job deleted out from under a stale cache entry, §4.5
    /// step 7) by dropping the offending occurrences and retrying once
    /// with the phantom rows removed.
    async fn persist_occurrences(
        &self,
        candidates: Vec<(CachedJob, JobOccurrence)>,
    ) -> MilvaionResult<Vec<(CachedJob, JobOccurrence)>> {
        let occurrences: Vec<JobOccurrence> = candidates.iter().map(|(_, occ)| occ.clone()).collect();

        match self.store.insert_occurrences_bulk(&occurrences).await {
            Ok(()) => Ok(candidates),
            Err(MilvaionError::StoreConstraint(msg)) => {
                warn!(error = %msg, "bulk occurrence insert hit a constraint violation, recovering phantom jobs");
                let ids: Vec<JobId> = candidates.iter().map(|(job, _)| job.id).collect();
                let existing = self.store.existing_job_ids(&ids).await?;

                let mut survivors = Vec::new();
                for (job, occurrence) in candidates {
                    if existing.contains(&job.id) {
                        survivors.push((job, occurrence));
                    } else {
                        warn!(job_id = %job.id, "dropping occurrence for job no longer present in the store");
                        if let Err(e) = self.scheduler_client.remove_cached_job(job.id).await {
                            warn!(job_id = %job.id, error = %e, "failed to evict phantom job from cache");
                        }
                        let _ = self.scheduler_client.remove_from_scheduled_set(job.id).await;
                    }
                }

                if survivors.is_empty() {
                    return Ok(Vec::new());
                }

                let retry: Vec<JobOccurrence> = survivors.iter().map(|(_, occ)| occ.clone()).collect();
                self.store.insert_occurrences_bulk(&retry).await?;
                Ok(survivors)
            }
            Err(e) => Err(e),
        }
    }

    /// Publishes each persisted occurrence with bounded concurrency
    /// (`publish_concurrency`, default 4 — §4.5 step 9). Publishes are
    /// I/O-bound AMQP round-trips, so a `buffer_unordered` stream gives the
    /// same bounded-fan-out shape as a semaphore-gated worker pool without
    /// needing a spawned task per message.
    async fn publish_bounded(&self, items: Vec<(CachedJob, JobOccurrence)>, now: DateTime<Utc>) -> usize {
        let concurrency = self.config.publish_concurrency.max(1);
        let outcomes: Vec<bool> = stream::iter(items)
            .map(|(job, occurrence)| self.dispatch_one(job, occurrence, now))
            .buffer_unordered(concurrency)
            .collect()
            .await;
        outcomes.into_iter().filter(|ok| *ok).count()
    }

    /// Per-occurrence publish step (§4.5 step 9): acquire the per-job lock,
    /// publish, reschedule immediately (before releasing the lock, closing
    /// the race where this dispatcher would re-pick the same cron job
    /// before the worker finishes), then release. Losing the lock race
    /// fails the occurrence in place rather than retrying or dropping it
    /// silently — the lock holder is the one responsible for this fire.
    async fn dispatch_one(&self, job: CachedJob, occurrence: JobOccurrence, now: DateTime<Utc>) -> bool {
        let acquired = match self.lock_service.try_acquire_lock(job.id, &self.instance_id, self.config.lock_ttl()).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "lock acquisition attempt failed, treating as contended");
                false
            }
        };

        if !acquired {
            DispatcherMetrics::lock_contended();
            self.fail_lock_contended(job, occurrence).await;
            return false;
        }

        if job.concurrent_execution_policy == ConcurrencyPolicy::Skip {
            let ttl = StdDuration::from_secs(u64::from(job.execution_timeout_seconds.max(1)));
            if let Err(e) = self.scheduler_client.try_mark_job_as_running(job.id, occurrence.id, ttl).await {
                warn!(job_id = %job.id, error = %e, "failed to set running marker, proceeding without it");
            }
        }

        let published = self.publish_one(job.clone(), occurrence).await;

        self.reschedule(&job, now).await;

        if let Err(e) = self.lock_service.release_lock(job.id, &self.instance_id).await {
            warn!(job_id = %job.id, error = %e, "failed to release dispatch lock, it will expire on its own");
        }

        published
    }

    /// The lock-contention branch of the §7 error table: the losing
    /// dispatcher's occurrence is persisted as `Failed` with reason
    /// "duplicate dispatch prevented by lock" rather than never having
    /// existed. This dispatcher does not reschedule — the lock holder owns
    /// that responsibility for this fire.
    async fn fail_lock_contended(&self, job: CachedJob, mut occurrence: JobOccurrence) {
        let reason = "duplicate dispatch prevented by lock".to_string();
        occurrence.record_transition(occurrence.status, OccurrenceStatus::Failed);
        occurrence.status = OccurrenceStatus::Failed;
        occurrence.end_time = Some(Utc::now());
        occurrence.exception = Some(reason);

        if let Err(e) = self.store.update_occurrences_bulk(std::slice::from_ref(&occurrence)).await {
            error!(job_id = %job.id, occurrence_id = %occurrence.id, error = %e, "failed to persist lock-contended occurrence");
        }
    }

    pub(super) async fn publish_one(&self, job: CachedJob, occurrence: JobOccurrence) -> bool {
        let routing_key = format!("{}.{}", job.job_name_in_worker, occurrence.id);
        let envelope = DispatchEnvelope::from(&job);

        match self
            .publisher
            .publish_dispatch(&routing_key, &envelope, occurrence.id, self.config.max_retry_attempts)
            .await
        {
            Ok(()) => {
                DispatcherMetrics::published();
                true
            }
            Err(e) => {
                warn!(job_id = %job.id, occurrence_id = %occurrence.id, error = %e, "dispatch publish failed");
                self.handle_publish_failure(job, occurrence).await;
                false
            }
        }
    }

    /// On a failed publish, bumps the occurrence's own retry bookkeeping
    /// (picked up later by the retry sweep) or, once the dispatch-retry
    /// budget is exhausted, fails the occurrence and writes a dead-letter
    /// record directly — no worker ever saw this occurrence, so the
    /// failed-occurrence handler's DLQ consumption path does not apply.
    pub(super) async fn handle_publish_failure(&self, job: CachedJob, mut occurrence: JobOccurrence) {
        occurrence.dispatch_retry_count += 1;
        let policy = RetryPolicy::dispatch_sweep();

        if occurrence.dispatch_retry_count >= policy.max_attempts {
            let reason = "dispatch retries exhausted: could not publish to the message bus".to_string();
            occurrence.record_transition(occurrence.status, OccurrenceStatus::Failed);
            occurrence.status = OccurrenceStatus::Failed;
            occurrence.end_time = Some(Utc::now());
            occurrence.exception = Some(reason.clone());

            if let Err(e) = self.store.update_occurrences_bulk(std::slice::from_ref(&occurrence)).await {
                error!(occurrence_id = %occurrence.id, error = %e, "failed to persist exhausted-retry occurrence");
            }

            let failed = FailedOccurrence::new(
                job.id,
                occurrence.id,
                job.display_name.clone(),
                job.job_name_in_worker.clone(),
                job.worker_id.clone(),
                job.job_data.clone(),
                FailureType::MaxRetriesExceeded,
                Some(reason),
                occurrence.dispatch_retry_count,
                occurrence.created_at,
            );
            if let Err(e) = self.store.insert_failed_occurrence(&failed).await {
                error!(occurrence_id = %occurrence.id, error = %e, "failed to write dead-letter record for exhausted dispatch");
            }
            DispatcherMetrics::skipped("dispatch_exhausted");
        } else {
            let delay = policy.delay_for_attempt(occurrence.dispatch_retry_count);
            occurrence.next_dispatch_retry_at =
                Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
            if let Err(e) = self.store.update_occurrences_bulk(std::slice::from_ref(&occurrence)).await {
                error!(occurrence_id = %occurrence.id, error = %e, "failed to persist dispatch-retry bookkeeping");
            }
        }

        if job.concurrent_execution_policy == ConcurrencyPolicy::Skip {
            if let Err(e) = self.scheduler_client.mark_job_as_completed(job.id).await {
                warn!(job_id = %job.id, error = %e, "failed to release running marker after publish failure");
            }
        }
    }
}

/// §4.5 step 6: a `Skip`-policy job with no already-running occurrence may
/// dispatch only if its own worker queue is empty; a failed depth probe is
/// treated as empty rather than blocking dispatch indefinitely (the caller
/// logs the failure separately).
fn queue_is_clear(depth: MilvaionResult<u32>) -> bool {
    !matches!(depth, Ok(d) if d > 0)
}

/// §4.5 step 6's per-due-job routing decision, isolated from the
/// surrounding I/O so the three outcomes that distinguish "drop from the
/// index" (inactive), "leave due as-is" (concurrency-gated — due again
/// next poll, no cron jump) and "reschedule to the next cron fire"
/// (worker-at-capacity) can be asserted without a live Redis connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum DueJobRoute {
    RemoveFromIndex,
    LeaveDue,
    Reschedule,
    Eligible,
}

fn route_due_job(is_active: bool, passes_concurrency_gate: bool, worker_capacity_ok: bool) -> DueJobRoute {
    if !is_active {
        DueJobRoute::RemoveFromIndex
    } else if !passes_concurrency_gate {
        DueJobRoute::LeaveDue
    } else if !worker_capacity_ok {
        DueJobRoute::Reschedule
    } else {
        DueJobRoute::Eligible
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_is_clear_allows_dispatch_on_zero_depth() {
        assert!(queue_is_clear(Ok(0)));
    }

    #[test]
    fn queue_is_clear_blocks_dispatch_on_nonzero_depth() {
        assert!(!queue_is_clear(Ok(3)));
    }

    #[test]
    fn queue_is_clear_treats_inspection_failure_as_empty() {
        assert!(queue_is_clear(Err(MilvaionError::Bus("amqp down".into()))));
    }

    #[test]
    fn inactive_job_is_removed_from_index_regardless_of_gate_or_capacity() {
        assert_eq!(route_due_job(false, true, true), DueJobRoute::RemoveFromIndex);
        assert_eq!(route_due_job(false, false, false), DueJobRoute::RemoveFromIndex);
    }

    #[test]
    fn concurrency_gate_failure_leaves_job_due_without_rescheduling() {
        assert_eq!(route_due_job(true, false, true), DueJobRoute::LeaveDue);
        assert_eq!(route_due_job(true, false, false), DueJobRoute::LeaveDue);
    }

    #[test]
    fn worker_capacity_failure_reschedules_to_next_cron_fire() {
        assert_eq!(route_due_job(true, true, false), DueJobRoute::Reschedule);
    }

    #[test]
    fn active_job_passing_every_gate_is_eligible() {
        assert_eq!(route_due_job(true, true, true), DueJobRoute::Eligible);
    }
}
