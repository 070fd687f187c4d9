//! `MySqlStore` — the `sqlx`-backed implementation of [`Store`], grounded
//! in the source's `MySqlUserRepository` for the row-mapping and
//! `query_as`/`query_scalar` idioms, generalized to three entities and the
//! bulk/FK-aware operations the dispatcher needs.

use super::pool::DatabasePoolInterface;
use super::rows::{
    failure_type_code, occurrence_status_code, FailedOccurrenceRow, JobOccurrenceRow,
    ScheduledJobRow,
};
use crate::traits::Store;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use milvaion_core::{
    FailedOccurrence, JobId, JobOccurrence, LogEntry, MilvaionError, MilvaionResult, OccurrenceId,
    ScheduledJob,
};
use sqlx::{MySqlPool, QueryBuilder, Row};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

const SCHEDULED_JOB_COLUMNS: &str = "id, display_name, job_name_in_worker, worker_id, job_data, \
    cron_expression, execute_at, is_active, concurrent_execution_policy, \
    execution_timeout_seconds, zombie_timeout_minutes, version, auto_disable_enabled, \
    auto_disable_threshold, consecutive_failure_count, last_failure_time, disabled_at, \
    disable_reason";

const JOB_OCCURRENCE_COLUMNS: &str = "id, job_id, job_name, job_version, worker_id, status, \
    created_at, start_time, end_time, duration_ms, result, exception, last_heartbeat, \
    dispatch_retry_count, next_dispatch_retry_at, logs, status_change_logs, \
    zombie_timeout_minutes, execution_timeout_seconds";

const FAILED_OCCURRENCE_COLUMNS: &str = "id, job_id, occurrence_id, correlation_id, \
    job_display_name, job_name_in_worker, worker_id, job_data, exception, failed_at, \
    retry_count, failure_type, original_execute_at, resolved, resolution_note, \
    resolution_action, resolved_at";

/// Relational persistence for `ScheduledJob`, `JobOccurrence`, and
/// `FailedOccurrence`, backed by a MySQL pool.
#[derive(Clone)]
pub struct MySqlStore {
    pool: Arc<dyn DatabasePoolInterface>,
}

impl MySqlStore {
    #[must_use]
    pub fn new(pool: Arc<dyn DatabasePoolInterface>) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &MySqlPool {
        self.pool.inner()
    }
}

#[async_trait]
impl Store for MySqlStore {
    async fn health_check(&self) -> MilvaionResult<()> {
        self.pool.health_check().await
    }

    async fn get_active_job(&self, id: JobId) -> MilvaionResult<Option<ScheduledJob>> {
        let row = sqlx::query_as::<_, ScheduledJobRow>(&format!(
            "SELECT {SCHEDULED_JOB_COLUMNS} FROM scheduled_jobs WHERE id = ? AND is_active = TRUE"
        ))
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;

        row.map(ScheduledJob::try_from).transpose()
    }

    async fn get_jobs_bulk(&self, ids: &[JobId]) -> MilvaionResult<Vec<ScheduledJob>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::new(format!(
            "SELECT {SCHEDULED_JOB_COLUMNS} FROM scheduled_jobs WHERE id IN ("
        ));
        push_id_list(&mut builder, ids);
        builder.push(")");

        let rows = builder
            .build_query_as::<ScheduledJobRow>()
            .fetch_all(self.pool())
            .await?;

        rows.into_iter().map(ScheduledJob::try_from).collect()
    }

    async fn list_active_jobs(&self) -> MilvaionResult<Vec<ScheduledJob>> {
        let rows = sqlx::query_as::<_, ScheduledJobRow>(&format!(
            "SELECT {SCHEDULED_JOB_COLUMNS} FROM scheduled_jobs WHERE is_active = TRUE"
        ))
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(ScheduledJob::try_from).collect()
    }

    async fn existing_job_ids(&self, ids: &[JobId]) -> MilvaionResult<HashSet<JobId>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let mut builder = QueryBuilder::new("SELECT id FROM scheduled_jobs WHERE id IN (");
        push_id_list(&mut builder, ids);
        builder.push(")");

        let rows = builder.build().fetch_all(self.pool()).await?;
        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(|e| MilvaionError::Store(e.to_string()))?;
                JobId::parse(&id).map_err(|e| MilvaionError::Internal(format!("invalid job id in store: {e}")))
            })
            .collect()
    }

    async fn record_job_failure(
        &self,
        job_id: JobId,
        occurred_at: DateTime<Utc>,
        window: ChronoDuration,
    ) -> MilvaionResult<()> {
        let window_cutoff = occurred_at - window;
        sqlx::query(
            "UPDATE scheduled_jobs \
             SET consecutive_failure_count = CASE \
                     WHEN last_failure_time IS NOT NULL AND last_failure_time >= ? \
                     THEN consecutive_failure_count + 1 \
                     ELSE 1 \
                 END, \
                 last_failure_time = ? \
             WHERE id = ?",
        )
        .bind(window_cutoff)
        .bind(occurred_at)
        .bind(job_id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn record_job_success(&self, job_id: JobId) -> MilvaionResult<()> {
        sqlx::query(
            "UPDATE scheduled_jobs SET consecutive_failure_count = 0, last_failure_time = NULL \
             WHERE id = ?",
        )
        .bind(job_id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn auto_disable_job(&self, job_id: JobId, reason: String) -> MilvaionResult<()> {
        sqlx::query(
            "UPDATE scheduled_jobs \
             SET is_active = FALSE, disabled_at = ?, disable_reason = ?, version = version + 1 \
             WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(reason)
        .bind(job_id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn insert_occurrences_bulk(&self, occurrences: &[JobOccurrence]) -> MilvaionResult<()> {
        if occurrences.is_empty() {
            return Ok(());
        }
        let mut builder = QueryBuilder::new(format!(
            "INSERT INTO job_occurrences ({JOB_OCCURRENCE_COLUMNS}) "
        ));
        builder.push_values(occurrences, |mut b, occ| {
            b.push_bind(occ.id.to_string())
                .push_bind(occ.job_id.to_string())
                .push_bind(occ.job_name.clone())
                .push_bind(occ.job_version)
                .push_bind(occ.worker_id.clone())
                .push_bind(occurrence_status_code(occ.status))
                .push_bind(occ.created_at)
                .push_bind(occ.start_time)
                .push_bind(occ.end_time)
                .push_bind(occ.duration_ms)
                .push_bind(occ.result.clone())
                .push_bind(occ.exception.clone())
                .push_bind(occ.last_heartbeat)
                .push_bind(occ.dispatch_retry_count)
                .push_bind(occ.next_dispatch_retry_at)
                .push_bind(sqlx::types::Json(occ.logs.clone()))
                .push_bind(sqlx::types::Json(occ.status_change_logs.clone()))
                .push_bind(occ.zombie_timeout_minutes)
                .push_bind(occ.execution_timeout_seconds);
        });

        builder.build().execute(self.pool()).await?;
        Ok(())
    }

    async fn get_occurrence(&self, id: OccurrenceId) -> MilvaionResult<Option<JobOccurrence>> {
        let row = sqlx::query_as::<_, JobOccurrenceRow>(&format!(
            "SELECT {JOB_OCCURRENCE_COLUMNS} FROM job_occurrences WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;

        row.map(JobOccurrence::try_from).transpose()
    }

    async fn get_occurrences_bulk(&self, ids: &[OccurrenceId]) -> MilvaionResult<Vec<JobOccurrence>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::new(format!(
            "SELECT {JOB_OCCURRENCE_COLUMNS} FROM job_occurrences WHERE id IN ("
        ));
        push_id_list(&mut builder, ids);
        builder.push(")");

        let rows = builder
            .build_query_as::<JobOccurrenceRow>()
            .fetch_all(self.pool())
            .await?;

        rows.into_iter().map(JobOccurrence::try_from).collect()
    }

    async fn update_occurrences_bulk(&self, occurrences: &[JobOccurrence]) -> MilvaionResult<()> {
        if occurrences.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool().begin().await?;
        for occ in occurrences {
            sqlx::query(
                "UPDATE job_occurrences \
                 SET job_name = ?, job_version = ?, worker_id = ?, status = ?, start_time = ?, \
                     end_time = ?, duration_ms = ?, result = ?, exception = ?, last_heartbeat = ?, \
                     dispatch_retry_count = ?, next_dispatch_retry_at = ?, logs = ?, \
                     status_change_logs = ?, zombie_timeout_minutes = ?, \
                     execution_timeout_seconds = ? \
                 WHERE id = ?",
            )
            .bind(&occ.job_name)
            .bind(occ.job_version)
            .bind(&occ.worker_id)
            .bind(occurrence_status_code(occ.status))
            .bind(occ.start_time)
            .bind(occ.end_time)
            .bind(occ.duration_ms)
            .bind(&occ.result)
            .bind(&occ.exception)
            .bind(occ.last_heartbeat)
            .bind(occ.dispatch_retry_count)
            .bind(occ.next_dispatch_retry_at)
            .bind(sqlx::types::Json(&occ.logs))
            .bind(sqlx::types::Json(&occ.status_change_logs))
            .bind(occ.zombie_timeout_minutes)
            .bind(occ.execution_timeout_seconds)
            .bind(occ.id.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn append_logs_bulk(&self, updates: &[(OccurrenceId, Vec<LogEntry>)]) -> MilvaionResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool().begin().await?;
        for (id, new_entries) in updates {
            let existing: Option<sqlx::types::Json<Vec<LogEntry>>> =
                sqlx::query_scalar("SELECT logs FROM job_occurrences WHERE id = ? FOR UPDATE")
                    .bind(id.to_string())
                    .fetch_optional(&mut *tx)
                    .await?;

            let Some(mut logs) = existing.map(|j| j.0) else {
                debug!(correlation_id = %id, "log append for unknown occurrence, dropping");
                continue;
            };
            logs.extend(new_entries.iter().cloned());

            sqlx::query("UPDATE job_occurrences SET logs = ? WHERE id = ?")
                .bind(sqlx::types::Json(logs))
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find_stale_queued(
        &self,
        now: DateTime<Utc>,
        default_timeout_minutes: u32,
    ) -> MilvaionResult<Vec<JobOccurrence>> {
        let rows = sqlx::query_as::<_, JobOccurrenceRow>(&format!(
            "SELECT {JOB_OCCURRENCE_COLUMNS} FROM job_occurrences \
             WHERE status = 0 \
               AND created_at <= DATE_SUB(?, INTERVAL COALESCE(zombie_timeout_minutes, ?) MINUTE)"
        ))
        .bind(now)
        .bind(default_timeout_minutes)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(JobOccurrence::try_from).collect()
    }

    async fn find_lost_running(
        &self,
        now: DateTime<Utc>,
        default_timeout_minutes: u32,
    ) -> MilvaionResult<Vec<JobOccurrence>> {
        let rows = sqlx::query_as::<_, JobOccurrenceRow>(&format!(
            "SELECT {JOB_OCCURRENCE_COLUMNS} FROM job_occurrences \
             WHERE status = 1 \
               AND (last_heartbeat IS NULL \
                    OR last_heartbeat <= DATE_SUB(?, INTERVAL COALESCE(zombie_timeout_minutes, ?) MINUTE))"
        ))
        .bind(now)
        .bind(default_timeout_minutes)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(JobOccurrence::try_from).collect()
    }

    async fn find_pending_dispatch_retries(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> MilvaionResult<Vec<JobOccurrence>> {
        let rows = sqlx::query_as::<_, JobOccurrenceRow>(&format!(
            "SELECT {JOB_OCCURRENCE_COLUMNS} FROM job_occurrences \
             WHERE status = 0 AND next_dispatch_retry_at IS NOT NULL \
               AND next_dispatch_retry_at <= ? AND dispatch_retry_count < ?"
        ))
        .bind(now)
        .bind(max_attempts)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(JobOccurrence::try_from).collect()
    }

    async fn fail_stale_occurrences_on_startup(&self, cutoff: DateTime<Utc>) -> MilvaionResult<u64> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE job_occurrences \
             SET status = 3, end_time = ?, \
                 duration_ms = TIMESTAMPDIFF(MICROSECOND, created_at, ?) / 1000, \
                 exception = 'system restart' \
             WHERE status IN (0, 1) AND created_at < ?",
        )
        .bind(now)
        .bind(now)
        .bind(cutoff)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }

    async fn insert_failed_occurrence(&self, failed: &FailedOccurrence) -> MilvaionResult<()> {
        sqlx::query(&format!(
            "INSERT INTO failed_occurrences ({FAILED_OCCURRENCE_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE occurrence_id = occurrence_id"
        ))
        .bind(failed.id.to_string())
        .bind(failed.job_id.to_string())
        .bind(failed.occurrence_id.to_string())
        .bind(failed.correlation_id.to_string())
        .bind(&failed.job_display_name)
        .bind(&failed.job_name_in_worker)
        .bind(&failed.worker_id)
        .bind(&failed.job_data)
        .bind(&failed.exception)
        .bind(failed.failed_at)
        .bind(failed.retry_count)
        .bind(failure_type_code(failed.failure_type))
        .bind(failed.original_execute_at)
        .bind(failed.resolved)
        .bind(&failed.resolution_note)
        .bind(&failed.resolution_action)
        .bind(failed.resolved_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

fn push_id_list<T: std::fmt::Display>(builder: &mut QueryBuilder<'_, sqlx::MySql>, ids: &[T]) {
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(id.to_string());
    }
}
