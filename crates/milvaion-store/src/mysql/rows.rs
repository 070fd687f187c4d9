//! Row types and `TryFrom` conversions, grounded in the source's
//! `UserRow`/`TryFrom<UserRow> for User` pattern
//! (`arcana-repository::mysql::user_repository`).

use milvaion_core::{
    AutoDisableSettings, ConcurrencyPolicy, FailedOccurrence, FailureType, JobId, JobOccurrence,
    LogEntry, MilvaionError, MilvaionResult, OccurrenceId, OccurrenceStatus, ScheduledJob,
    StatusChange,
};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::VecDeque;

#[derive(Debug, FromRow)]
pub(crate) struct ScheduledJobRow {
    pub id: String,
    pub display_name: String,
    pub job_name_in_worker: String,
    pub worker_id: Option<String>,
    pub job_data: String,
    pub cron_expression: Option<String>,
    pub execute_at: chrono::DateTime<chrono::Utc>,
    pub is_active: bool,
    pub concurrent_execution_policy: String,
    pub execution_timeout_seconds: u32,
    pub zombie_timeout_minutes: Option<u32>,
    pub version: u64,
    pub auto_disable_enabled: bool,
    pub auto_disable_threshold: Option<u32>,
    pub consecutive_failure_count: u32,
    pub last_failure_time: Option<chrono::DateTime<chrono::Utc>>,
    pub disabled_at: Option<chrono::DateTime<chrono::Utc>>,
    pub disable_reason: Option<String>,
}

impl TryFrom<ScheduledJobRow> for ScheduledJob {
    type Error = MilvaionError;

    fn try_from(row: ScheduledJobRow) -> MilvaionResult<Self> {
        Ok(Self {
            id: JobId::parse(&row.id)
                .map_err(|e| MilvaionError::Internal(format!("invalid job id in store: {e}")))?,
            display_name: row.display_name,
            job_name_in_worker: row.job_name_in_worker,
            worker_id: row.worker_id,
            job_data: row.job_data,
            cron_expression: row.cron_expression,
            execute_at: row.execute_at,
            is_active: row.is_active,
            concurrent_execution_policy: parse_concurrency_policy(&row.concurrent_execution_policy),
            execution_timeout_seconds: row.execution_timeout_seconds,
            zombie_timeout_minutes: row.zombie_timeout_minutes,
            version: row.version,
            auto_disable_settings: AutoDisableSettings {
                enabled: row.auto_disable_enabled,
                threshold: row.auto_disable_threshold,
                consecutive_failure_count: row.consecutive_failure_count,
                last_failure_time: row.last_failure_time,
                disabled_at: row.disabled_at,
                disable_reason: row.disable_reason,
            },
        })
    }
}

fn parse_concurrency_policy(s: &str) -> ConcurrencyPolicy {
    match s {
        "Queue" => ConcurrencyPolicy::Queue,
        _ => ConcurrencyPolicy::Skip,
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct JobOccurrenceRow {
    pub id: String,
    pub job_id: String,
    pub job_name: String,
    pub job_version: u64,
    pub worker_id: Option<String>,
    pub status: i8,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    pub duration_ms: Option<i64>,
    pub result: Option<String>,
    pub exception: Option<String>,
    pub last_heartbeat: Option<chrono::DateTime<chrono::Utc>>,
    pub dispatch_retry_count: u32,
    pub next_dispatch_retry_at: Option<chrono::DateTime<chrono::Utc>>,
    pub logs: Json<Vec<LogEntry>>,
    pub status_change_logs: Json<VecDeque<StatusChange>>,
    pub zombie_timeout_minutes: Option<u32>,
    pub execution_timeout_seconds: Option<u32>,
}

impl TryFrom<JobOccurrenceRow> for JobOccurrence {
    type Error = MilvaionError;

    fn try_from(row: JobOccurrenceRow) -> MilvaionResult<Self> {
        Ok(Self {
            id: OccurrenceId::parse(&row.id)
                .map_err(|e| MilvaionError::Internal(format!("invalid occurrence id in store: {e}")))?,
            job_id: JobId::parse(&row.job_id)
                .map_err(|e| MilvaionError::Internal(format!("invalid job id in store: {e}")))?,
            job_name: row.job_name,
            job_version: row.job_version,
            worker_id: row.worker_id,
            status: occurrence_status_from_code(row.status)?,
            created_at: row.created_at,
            start_time: row.start_time,
            end_time: row.end_time,
            duration_ms: row.duration_ms,
            result: row.result,
            exception: row.exception,
            last_heartbeat: row.last_heartbeat,
            dispatch_retry_count: row.dispatch_retry_count,
            next_dispatch_retry_at: row.next_dispatch_retry_at,
            logs: row.logs.0,
            status_change_logs: row.status_change_logs.0,
            zombie_timeout_minutes: row.zombie_timeout_minutes,
            execution_timeout_seconds: row.execution_timeout_seconds,
        })
    }
}

pub(crate) fn occurrence_status_from_code(code: i8) -> MilvaionResult<OccurrenceStatus> {
    match code {
        0 => Ok(OccurrenceStatus::Queued),
        1 => Ok(OccurrenceStatus::Running),
        2 => Ok(OccurrenceStatus::Completed),
        3 => Ok(OccurrenceStatus::Failed),
        4 => Ok(OccurrenceStatus::Cancelled),
        5 => Ok(OccurrenceStatus::TimedOut),
        6 => Ok(OccurrenceStatus::Unknown),
        other => Err(MilvaionError::Internal(format!(
            "unknown occurrence status code {other} in store"
        ))),
    }
}

#[must_use]
pub(crate) const fn occurrence_status_code(status: OccurrenceStatus) -> i8 {
    status as i8
}

#[derive(Debug, FromRow)]
pub(crate) struct FailedOccurrenceRow {
    pub id: String,
    pub job_id: String,
    pub occurrence_id: String,
    pub correlation_id: String,
    pub job_display_name: String,
    pub job_name_in_worker: String,
    pub worker_id: Option<String>,
    pub job_data: String,
    pub exception: Option<String>,
    pub failed_at: chrono::DateTime<chrono::Utc>,
    pub retry_count: u32,
    pub failure_type: String,
    pub original_execute_at: chrono::DateTime<chrono::Utc>,
    pub resolved: bool,
    pub resolution_note: Option<String>,
    pub resolution_action: Option<String>,
    pub resolved_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl TryFrom<FailedOccurrenceRow> for FailedOccurrence {
    type Error = MilvaionError;

    fn try_from(row: FailedOccurrenceRow) -> MilvaionResult<Self> {
        Ok(Self {
            id: milvaion_core::FailedOccurrenceId::parse(&row.id)
                .map_err(|e| MilvaionError::Internal(format!("invalid failed-occurrence id: {e}")))?,
            job_id: JobId::parse(&row.job_id)
                .map_err(|e| MilvaionError::Internal(format!("invalid job id in store: {e}")))?,
            occurrence_id: OccurrenceId::parse(&row.occurrence_id)
                .map_err(|e| MilvaionError::Internal(format!("invalid occurrence id in store: {e}")))?,
            correlation_id: OccurrenceId::parse(&row.correlation_id)
                .map_err(|e| MilvaionError::Internal(format!("invalid correlation id in store: {e}")))?,
            job_display_name: row.job_display_name,
            job_name_in_worker: row.job_name_in_worker,
            worker_id: row.worker_id,
            job_data: row.job_data,
            exception: row.exception,
            failed_at: row.failed_at,
            retry_count: row.retry_count,
            failure_type: parse_failure_type(&row.failure_type),
            original_execute_at: row.original_execute_at,
            resolved: row.resolved,
            resolution_note: row.resolution_note,
            resolution_action: row.resolution_action,
            resolved_at: row.resolved_at,
        })
    }
}

fn parse_failure_type(s: &str) -> FailureType {
    match s {
        "MaxRetriesExceeded" => FailureType::MaxRetriesExceeded,
        "Timeout" => FailureType::Timeout,
        "Cancelled" => FailureType::Cancelled,
        "WorkerCrash" => FailureType::WorkerCrash,
        "ZombieDetection" => FailureType::ZombieDetection,
        _ => FailureType::UnhandledException,
    }
}

#[must_use]
pub(crate) const fn failure_type_code(failure_type: FailureType) -> &'static str {
    match failure_type {
        FailureType::MaxRetriesExceeded => "MaxRetriesExceeded",
        FailureType::Timeout => "Timeout",
        FailureType::Cancelled => "Cancelled",
        FailureType::WorkerCrash => "WorkerCrash",
        FailureType::ZombieDetection => "ZombieDetection",
        FailureType::UnhandledException => "UnhandledException",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_type_round_trips_through_its_stored_code() {
        let variants = [
            FailureType::MaxRetriesExceeded,
            FailureType::Timeout,
            FailureType::Cancelled,
            FailureType::WorkerCrash,
            FailureType::ZombieDetection,
            FailureType::UnhandledException,
        ];
        for variant in variants {
            let code = failure_type_code(variant);
            assert_eq!(failure_type_code(parse_failure_type(code)), code);
        }
    }

    #[test]
    fn unrecognized_failure_type_falls_back_to_unhandled_exception() {
        assert_eq!(parse_failure_type("SomethingNew"), FailureType::UnhandledException);
    }

    #[test]
    fn concurrency_policy_falls_back_to_skip() {
        assert_eq!(parse_concurrency_policy("Queue"), ConcurrencyPolicy::Queue);
        assert_eq!(parse_concurrency_policy("garbage"), ConcurrencyPolicy::Skip);
    }
}
