//! `JobOccurrence` — one execution attempt of a scheduled job, and the
//! state machine that governs it.

use crate::id::{JobId, OccurrenceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::collections::VecDeque;

/// Occurrence status codes, stable across the wire (spec §6): 0 Queued,
/// 1 Running, 2 Completed, 3 Failed, 4 Cancelled, 5 TimedOut, 6 Unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(i32)]
pub enum OccurrenceStatus {
    Queued = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
    TimedOut = 5,
    Unknown = 6,
}

impl OccurrenceStatus {
    /// Final statuses accept no further status transitions (logs/exception
    /// clearing on a late Completed aside — see `JobOccurrence::apply_update`).
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut | Self::Unknown
        )
    }

    /// Whether `self -> to` is a legal transition per the state machine in
    /// spec §4.6. A terminal status repeating itself is a no-op, not an
    /// error, and is intentionally accepted here so callers can detect it
    /// via `from == to` rather than treat it as illegal.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        if self.is_final() {
            return to == self;
        }
        match (self, to) {
            (Self::Queued, Self::Running | Self::Cancelled | Self::Unknown) => true,
            (Self::Queued, Self::Failed) => true,
            (Self::Running, Self::Running) => true,
            (
                Self::Running,
                Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled | Self::Unknown,
            ) => true,
            _ => false,
        }
    }
}

/// Severity of a worker-emitted log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Information,
    Warning,
    Error,
    Debug,
}

/// One worker-emitted log line, attached to an occurrence by the log
/// collector (C7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub category: String,
    pub data: Option<String>,
}

/// One recorded status transition, retained for audit/debugging up to the
/// cap enforced by `JobOccurrence::record_transition`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub timestamp: DateTime<Utc>,
    pub from: OccurrenceStatus,
    pub to: OccurrenceStatus,
}

/// Upper bound on `JobOccurrence::status_change_logs`; a cap, not a
/// sliding window — oldest entries are evicted once the bound is reached.
pub const STATUS_CHANGE_LOG_CAP: usize = 100;

/// One execution attempt of a `ScheduledJob`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOccurrence {
    /// Equal to the correlation id threaded through dispatch -> execution
    /// -> status updates -> logs -> DLQ record.
    pub id: OccurrenceId,
    pub job_id: JobId,
    pub job_name: String,
    /// Snapshot of `ScheduledJob.version` at dispatch time; never changes.
    pub job_version: u64,
    pub worker_id: Option<String>,
    pub status: OccurrenceStatus,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub result: Option<String>,
    pub exception: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Scheduler-side publish retry count; distinct from any worker-side
    /// retry the (out-of-scope) in-worker SDK performs.
    pub dispatch_retry_count: u32,
    pub next_dispatch_retry_at: Option<DateTime<Utc>>,
    pub logs: Vec<LogEntry>,
    pub status_change_logs: VecDeque<StatusChange>,
    pub zombie_timeout_minutes: Option<u32>,
    pub execution_timeout_seconds: Option<u32>,
}

impl JobOccurrence {
    /// Constructs a freshly dispatched occurrence (dispatcher §4.5 step 6):
    /// `status=Queued`, a fresh time-ordered id, and an initial "dispatched"
    /// log entry.
    #[must_use]
    pub fn new_queued(job_id: JobId, job_name: String, job_version: u64) -> Self {
        let now = Utc::now();
        Self {
            id: OccurrenceId::new(),
            job_id,
            job_name,
            job_version,
            worker_id: None,
            status: OccurrenceStatus::Queued,
            created_at: now,
            start_time: None,
            end_time: None,
            duration_ms: None,
            result: None,
            exception: None,
            last_heartbeat: None,
            dispatch_retry_count: 0,
            next_dispatch_retry_at: None,
            logs: vec![LogEntry {
                timestamp: now,
                level: LogLevel::Information,
                message: "dispatched".into(),
                category: "dispatcher".into(),
                data: None,
            }],
            status_change_logs: VecDeque::new(),
            zombie_timeout_minutes: None,
            execution_timeout_seconds: None,
        }
    }

    /// Records a status transition, evicting the oldest entry once the
    /// 100-entry cap (spec §3, §8 invariant 11) is reached. No-op if
    /// `from == to` (a repeated terminal update or a heartbeat).
    pub fn record_transition(&mut self, from: OccurrenceStatus, to: OccurrenceStatus) {
        if from == to {
            return;
        }
        if self.status_change_logs.len() >= STATUS_CHANGE_LOG_CAP {
            self.status_change_logs.pop_front();
        }
        self.status_change_logs.push_back(StatusChange {
            timestamp: Utc::now(),
            from,
            to,
        });
    }

    /// True once the occurrence has reached a final status.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }
}

/// Exception text is capped to keep `FailedOccurrence` rows and occurrence
/// updates bounded; ~3 KB per spec §4.9/§9.
pub const EXCEPTION_TRUNCATION_BYTES: usize = 3000;

/// Truncates `text` to at most `max_bytes`, preferring to cut at the last
/// newline within the retained region so error messages aren't split
/// mid-line, and always appending a marker carrying the original and kept
/// sizes. Text already at or under the limit is returned unchanged — per
/// spec §8 boundary (10), exactly-at-threshold text is never marked
/// truncated.
#[must_use]
pub fn truncate_exception(text: &str, max_bytes: usize) -> String {
    let original_len = text.len();
    if original_len <= max_bytes {
        return text.to_string();
    }

    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }

    let half = cut / 2;
    if let Some(rel) = text[half..cut].rfind('\n') {
        cut = half + rel;
    }

    let kept = &text[..cut];
    format!(
        "{kept}\n[truncated — original {original_len}, kept {kept_len}]",
        kept_len = kept.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_to_running_is_legal() {
        assert!(OccurrenceStatus::Queued.can_transition_to(OccurrenceStatus::Running));
    }

    #[test]
    fn final_status_rejects_transitions_to_other_finals() {
        assert!(!OccurrenceStatus::Completed.can_transition_to(OccurrenceStatus::Failed));
    }

    #[test]
    fn repeated_terminal_update_is_accepted_as_noop() {
        assert!(OccurrenceStatus::Completed.can_transition_to(OccurrenceStatus::Completed));
    }

    #[test]
    fn running_to_running_heartbeat_is_legal() {
        assert!(OccurrenceStatus::Running.can_transition_to(OccurrenceStatus::Running));
    }

    #[test]
    fn queued_cannot_jump_to_completed() {
        assert!(!OccurrenceStatus::Queued.can_transition_to(OccurrenceStatus::Completed));
    }

    #[test]
    fn status_change_log_caps_at_100_and_evicts_oldest() {
        let mut occ = JobOccurrence::new_queued(JobId::new(), "job".into(), 1);
        let sequence = [
            OccurrenceStatus::Queued,
            OccurrenceStatus::Running,
            OccurrenceStatus::Queued,
        ];
        for i in 0..150 {
            let from = sequence[i % 2];
            let to = sequence[(i % 2) + 1];
            occ.record_transition(from, to);
        }
        assert_eq!(occ.status_change_logs.len(), STATUS_CHANGE_LOG_CAP);
    }

    #[test]
    fn exact_threshold_text_is_not_truncated() {
        let text = "a".repeat(EXCEPTION_TRUNCATION_BYTES);
        let result = truncate_exception(&text, EXCEPTION_TRUNCATION_BYTES);
        assert_eq!(result, text);
        assert!(!result.contains("truncated"));
    }

    #[test]
    fn over_threshold_text_is_truncated_and_marked() {
        let text = "x".repeat(EXCEPTION_TRUNCATION_BYTES + 500);
        let result = truncate_exception(&text, EXCEPTION_TRUNCATION_BYTES);
        assert!(result.contains("truncated"));
        assert!(result.len() < text.len());
    }

    #[test]
    fn truncation_prefers_cutting_at_last_newline_in_retained_region() {
        let mut text = "a".repeat(1600);
        text.push('\n');
        text.push_str(&"b".repeat(1600));
        let result = truncate_exception(&text, 2000);
        let kept_part = result.split("\n[truncated").next().unwrap();
        assert!(kept_part.ends_with('a') || kept_part.is_empty());
        assert!(!kept_part.contains('b'));
    }
}
