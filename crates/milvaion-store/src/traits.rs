//! The `Store` trait — the dispatcher, status tracker, log collector,
//! zombie detector, and failed-occurrence handler all depend on this trait
//! object, never on `MySqlStore` directly, so unit tests can swap in
//! [`MockStore`] (generated by `mockall::automock`) instead of a real
//! MySQL instance.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use milvaion_core::{
    FailedOccurrence, JobId, JobOccurrence, LogEntry, MilvaionResult, OccurrenceId, ScheduledJob,
};
use std::collections::HashSet;

#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    /// Pings the store; used by the dispatcher's start-up recovery step 1.
    async fn health_check(&self) -> MilvaionResult<()>;

    /// Loads one active job's dispatch projection, used to fill a cache
    /// miss (§4.5 step 3).
    async fn get_active_job(&self, id: JobId) -> MilvaionResult<Option<ScheduledJob>>;

    /// Bulk cache-miss fallback; jobs not found in the store are simply
    /// absent from the result (caller treats that as a stale index entry).
    async fn get_jobs_bulk(&self, ids: &[JobId]) -> MilvaionResult<Vec<ScheduledJob>>;

    /// Every currently active job, used by start-up recovery's reconcile
    /// (step 2) and repopulate (step 4) passes.
    async fn list_active_jobs(&self) -> MilvaionResult<Vec<ScheduledJob>>;

    /// Of `ids`, the subset that still exist in the store — used to
    /// recover from a foreign-key violation on bulk occurrence insert
    /// (§4.5 step 7: drop occurrences referencing a job that was deleted
    /// out from under the dispatcher).
    async fn existing_job_ids(&self, ids: &[JobId]) -> MilvaionResult<HashSet<JobId>>;

    /// Applies the status tracker's per-job auto-disable circuit breaker
    /// bookkeeping on a failure (§4.6): bumps `consecutive_failure_count`
    /// if `occurred_at` is within `window` of the previous failure,
    /// otherwise resets it to 1.
    async fn record_job_failure(
        &self,
        job_id: JobId,
        occurred_at: DateTime<Utc>,
        window: ChronoDuration,
    ) -> MilvaionResult<()>;

    /// Resets the failure streak on success, preserving `disabled_at`
    /// history (§4.6).
    async fn record_job_success(&self, job_id: JobId) -> MilvaionResult<()>;

    /// Flips `is_active=false`, stamps `disabled_at=now`, and records
    /// `disable_reason`, bumping `version` (§4.6 auto-disable trip).
    async fn auto_disable_job(&self, job_id: JobId, reason: String) -> MilvaionResult<()>;

    /// Inserts freshly dispatched occurrences in one statement. Returns
    /// `Err(MilvaionError::StoreConstraint(_))` on a foreign-key violation
    /// so the dispatcher can recover via `existing_job_ids` and retry with
    /// the phantom rows dropped (§4.5 step 7).
    async fn insert_occurrences_bulk(&self, occurrences: &[JobOccurrence]) -> MilvaionResult<()>;

    async fn get_occurrence(&self, id: OccurrenceId) -> MilvaionResult<Option<JobOccurrence>>;

    async fn get_occurrences_bulk(&self, ids: &[OccurrenceId]) -> MilvaionResult<Vec<JobOccurrence>>;

    /// Persists a batch of occurrences the caller has already merged
    /// in-memory (status tracker §4.6 step 5, zombie detector §4.8's one
    /// bulk update).
    async fn update_occurrences_bulk(&self, occurrences: &[JobOccurrence]) -> MilvaionResult<()>;

    /// Appends each occurrence's new log lines, one update per
    /// `correlation_id` (log collector §4.7).
    async fn append_logs_bulk(&self, updates: &[(OccurrenceId, Vec<LogEntry>)]) -> MilvaionResult<()>;

    /// `status=Queued` occurrences older than their (occurrence-specific or
    /// `default_timeout_minutes`) zombie timeout (zombie detector §4.8,
    /// queued-zombie sweep). Caller applies the transition and calls
    /// `update_occurrences_bulk`.
    async fn find_stale_queued(
        &self,
        now: DateTime<Utc>,
        default_timeout_minutes: u32,
    ) -> MilvaionResult<Vec<JobOccurrence>>;

    /// `status=Running` occurrences with no heartbeat within timeout
    /// (zombie detector §4.8, lost-running sweep).
    async fn find_lost_running(
        &self,
        now: DateTime<Utc>,
        default_timeout_minutes: u32,
    ) -> MilvaionResult<Vec<JobOccurrence>>;

    /// `status=Queued ∧ next_dispatch_retry_at ≤ now ∧ dispatch_retry_count
    /// < max_attempts` (dispatcher §4.5 step 11, retry sweep).
    async fn find_pending_dispatch_retries(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> MilvaionResult<Vec<JobOccurrence>>;

    /// Start-up recovery step 3: marks Queued/Running occurrences created
    /// before `cutoff` as Failed with reason "system restart". Returns the
    /// number of rows affected.
    async fn fail_stale_occurrences_on_startup(&self, cutoff: DateTime<Utc>) -> MilvaionResult<u64>;

    /// Writes a dead-letter record. Idempotent: a duplicate
    /// `occurrence_id` is silently ignored rather than erroring, giving
    /// testable property (8) for free when the failed-occurrence handler
    /// retries its own insert after a crash (§4.9, Open Question 3).
    async fn insert_failed_occurrence(&self, failed: &FailedOccurrence) -> MilvaionResult<()>;
}
