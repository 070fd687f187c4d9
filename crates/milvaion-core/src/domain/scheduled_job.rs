//! `ScheduledJob` — the durable definition of a recurring or one-time job.

use crate::id::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the dispatcher handles a job that is due while a previous occurrence
/// of it is still `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConcurrencyPolicy {
    /// Skip this tick; the job becomes due again on its next cron fire.
    Skip,
    /// Dispatch anyway; the worker side is expected to queue internally.
    Queue,
}

/// Per-job auto-disable (circuit breaker) bookkeeping, persisted alongside
/// the job so it survives dispatcher restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoDisableSettings {
    /// Whether this job participates in auto-disable at all. When `false`,
    /// failures are still tracked but never flip `is_active`.
    pub enabled: bool,
    /// Job-specific failure threshold; `None` defers to the global default.
    pub threshold: Option<u32>,
    pub consecutive_failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub disabled_at: Option<DateTime<Utc>>,
    pub disable_reason: Option<String>,
}

impl Default for AutoDisableSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: None,
            consecutive_failure_count: 0,
            last_failure_time: None,
            disabled_at: None,
            disable_reason: None,
        }
    }
}

/// The durable definition of a scheduled job. Owned exclusively by the
/// scheduler; created and edited through the (out-of-scope) admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: JobId,
    pub display_name: String,
    /// The name the worker's handler is registered under; routes dispatch
    /// messages via `{jobNameInWorker}.{occurrenceId}`.
    pub job_name_in_worker: String,
    /// Logical worker group. `None` means no worker-capacity gating.
    pub worker_id: Option<String>,
    /// Opaque payload handed to the worker verbatim.
    pub job_data: String,
    /// 5- or 6-field UTC cron expression. Wins over `execute_at` on
    /// reschedule when both are set.
    pub cron_expression: Option<String>,
    /// Authoritative next fire time; lives primarily in the Redis time
    /// index, mirrored here for durability and cold recovery.
    pub execute_at: DateTime<Utc>,
    pub is_active: bool,
    pub concurrent_execution_policy: ConcurrencyPolicy,
    pub execution_timeout_seconds: u32,
    pub zombie_timeout_minutes: Option<u32>,
    pub version: u64,
    pub auto_disable_settings: AutoDisableSettings,
}

impl ScheduledJob {
    /// The routing pattern a worker binds its queue to for this job,
    /// derived automatically from `job_name_in_worker` (e.g. `sendemail.*`).
    #[must_use]
    pub fn routing_pattern(&self) -> String {
        format!("{}.*", self.job_name_in_worker)
    }

    /// The binding routing key for one specific dispatched occurrence.
    #[must_use]
    pub fn routing_key(&self, occurrence_id: impl std::fmt::Display) -> String {
        format!("{}.{}", self.job_name_in_worker, occurrence_id)
    }

    /// Bumps `version`; callers must call this on any field mutation that
    /// affects execution semantics, per the invariant in spec §3.
    pub fn bump_version(&mut self) {
        self.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ScheduledJob {
        ScheduledJob {
            id: JobId::new(),
            display_name: "Send welcome email".into(),
            job_name_in_worker: "sendemail".into(),
            worker_id: Some("email-workers".into()),
            job_data: "{}".into(),
            cron_expression: Some("*/5 * * * *".into()),
            execute_at: Utc::now(),
            is_active: true,
            concurrent_execution_policy: ConcurrencyPolicy::Skip,
            execution_timeout_seconds: 300,
            zombie_timeout_minutes: None,
            version: 1,
            auto_disable_settings: AutoDisableSettings::default(),
        }
    }

    #[test]
    fn routing_pattern_is_wildcard_on_job_name() {
        assert_eq!(sample().routing_pattern(), "sendemail.*");
    }

    #[test]
    fn routing_key_includes_occurrence_id() {
        let job = sample();
        assert_eq!(job.routing_key("abc-123"), "sendemail.abc-123");
    }

    #[test]
    fn bump_version_increments_monotonically() {
        let mut job = sample();
        job.bump_version();
        job.bump_version();
        assert_eq!(job.version, 3);
    }
}
