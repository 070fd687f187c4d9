//! `FailedOccurrence` — the durable dead-letter record written once an
//! occurrence exhausts its retries or otherwise cannot be completed.

use crate::domain::occurrence::{truncate_exception, EXCEPTION_TRUNCATION_BYTES};
use crate::id::{FailedOccurrenceId, JobId, OccurrenceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why an occurrence ended up in the dead-letter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureType {
    /// The dispatch-retry-sweep exhausted its attempt budget (spec §4.9,
    /// Open Question 1: `maxRetries = 5` means five total attempts).
    MaxRetriesExceeded,
    /// The occurrence exceeded `execution_timeout_seconds` without
    /// reaching a final status.
    Timeout,
    /// Cancelled by an operator or the (out-of-scope) admin API mid-flight.
    Cancelled,
    /// The worker process that owned this occurrence disappeared without
    /// reporting a final status.
    WorkerCrash,
    /// The zombie detector (C8) reclaimed a stalled `Running` occurrence
    /// past `zombie_timeout_minutes`.
    ZombieDetection,
    /// The worker reported `Failed` with an exception the retry policy
    /// does not consider transient.
    UnhandledException,
}

/// A dead-letter record for one occurrence that could not be completed.
/// Written exactly once per occurrence — uniqueness enforced at the store
/// layer on `occurrence_id` (spec §8, testable property 8) so a crashed
/// failed-occurrence handler retrying its own insert is idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedOccurrence {
    pub id: FailedOccurrenceId,
    pub job_id: JobId,
    pub occurrence_id: OccurrenceId,
    /// Equal to `occurrence_id` — carried as its own field because the DLQ
    /// envelope (spec §6) and the durable record both name it independently.
    pub correlation_id: OccurrenceId,
    pub job_display_name: String,
    pub job_name_in_worker: String,
    pub worker_id: Option<String>,
    pub job_data: String,
    pub exception: Option<String>,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
    pub failure_type: FailureType,
    pub original_execute_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolution_note: Option<String>,
    pub resolution_action: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl FailedOccurrence {
    /// Builds a dead-letter record, truncating `exception` to the same
    /// bound applied to `JobOccurrence::exception`. `resolved` starts
    /// `false`; resolution is an out-of-scope admin-surface action that
    /// only ever flips these fields after the fact.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: JobId,
        occurrence_id: OccurrenceId,
        job_display_name: String,
        job_name_in_worker: String,
        worker_id: Option<String>,
        job_data: String,
        failure_type: FailureType,
        exception: Option<String>,
        retry_count: u32,
        original_execute_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: FailedOccurrenceId::new(),
            job_id,
            occurrence_id,
            correlation_id: occurrence_id,
            job_display_name,
            job_name_in_worker,
            worker_id,
            job_data,
            exception: exception
                .map(|text| truncate_exception(&text, EXCEPTION_TRUNCATION_BYTES)),
            failed_at: Utc::now(),
            retry_count,
            failure_type,
            original_execute_at,
            resolved: false,
            resolution_note: None,
            resolution_action: None,
            resolved_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_truncates_oversized_exception() {
        let huge = "e".repeat(EXCEPTION_TRUNCATION_BYTES + 1000);
        let failed = FailedOccurrence::new(
            JobId::new(),
            OccurrenceId::new(),
            "Send welcome email".into(),
            "sendemail".into(),
            Some("email-workers-1".into()),
            "{}".into(),
            FailureType::MaxRetriesExceeded,
            Some(huge),
            5,
            Utc::now(),
        );
        let exc = failed.exception.unwrap();
        assert!(exc.len() < EXCEPTION_TRUNCATION_BYTES + 1000);
        assert!(exc.contains("truncated"));
    }

    #[test]
    fn new_leaves_short_exception_untouched() {
        let failed = FailedOccurrence::new(
            JobId::new(),
            OccurrenceId::new(),
            "Send welcome email".into(),
            "sendemail".into(),
            None,
            "{}".into(),
            FailureType::Timeout,
            Some("boom".into()),
            1,
            Utc::now(),
        );
        assert_eq!(failed.exception.as_deref(), Some("boom"));
    }

    #[test]
    fn new_sets_correlation_id_equal_to_occurrence_id() {
        let occurrence_id = OccurrenceId::new();
        let failed = FailedOccurrence::new(
            JobId::new(),
            occurrence_id,
            "Send welcome email".into(),
            "sendemail".into(),
            None,
            "{}".into(),
            FailureType::WorkerCrash,
            None,
            0,
            Utc::now(),
        );
        assert_eq!(failed.correlation_id, occurrence_id);
        assert!(!failed.resolved);
        assert!(failed.resolved_at.is_none());
    }
}
