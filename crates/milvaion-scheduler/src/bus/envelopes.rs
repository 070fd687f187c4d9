//! Wire shapes for every queue in §6 EXTERNAL INTERFACES. Bodies are JSON;
//! `CorrelationId`/`MaxRetries`/`x-retry-count` travel as AMQP headers, not
//! in the body, so they're parsed separately by each consumer (see
//! `super::consumers::read_dispatch_headers`).

use crate::redis::CachedJob;
use chrono::{DateTime, Utc};
use milvaion_core::{JobId, LogEntry, OccurrenceId, OccurrenceStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Dispatch message body (topic exchange `jobs`, routing key
/// `{jobNameInWorker}.{occurrenceId}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEnvelope {
    pub id: JobId,
    pub display_name: String,
    pub job_name_in_worker: String,
    pub job_data: String,
    pub worker_id: Option<String>,
    pub execution_timeout_seconds: u32,
    pub version: u64,
}

impl From<&CachedJob> for DispatchEnvelope {
    fn from(job: &CachedJob) -> Self {
        Self {
            id: job.id,
            display_name: job.display_name.clone(),
            job_name_in_worker: job.job_name_in_worker.clone(),
            job_data: job.job_data.clone(),
            worker_id: job.worker_id.clone(),
            execution_timeout_seconds: job.execution_timeout_seconds,
            version: job.version,
        }
    }
}

/// Status update body (`status-updates` queue). A message carrying only
/// `status=Running` and no other fields is a heartbeat (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdateEnvelope {
    pub correlation_id: OccurrenceId,
    pub job_id: JobId,
    pub worker_id: Option<String>,
    pub status: OccurrenceStatus,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub exception: Option<String>,
}

impl StatusUpdateEnvelope {
    #[must_use]
    pub fn is_heartbeat_only(&self) -> bool {
        matches!(self.status, OccurrenceStatus::Running)
            && self.start_time.is_none()
            && self.end_time.is_none()
            && self.duration_ms.is_none()
            && self.result.is_none()
            && self.exception.is_none()
    }
}

/// Worker log body (`worker-logs` queue).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEnvelope {
    pub correlation_id: OccurrenceId,
    pub log: LogEntry,
}

/// One entry of `RegistrationEnvelope::job_configs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfigEnvelope {
    pub job_type: String,
    pub consumer_id: String,
    #[serde(default)]
    pub max_parallel_jobs: Option<u32>,
    #[serde(default)]
    pub execution_timeout_seconds: Option<u32>,
}

/// Worker registration body (`worker-registration` queue).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationEnvelope {
    pub worker_id: String,
    pub instance_id: String,
    pub host_name: String,
    pub ip_address: String,
    pub version: String,
    #[serde(default)]
    pub max_parallel_jobs: Option<u32>,
    #[serde(default)]
    pub routing_patterns: HashMap<String, String>,
    #[serde(default)]
    pub job_configs: Vec<JobConfigEnvelope>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Worker heartbeat body (`worker-heartbeat` queue).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatEnvelope {
    pub worker_id: String,
    pub instance_id: String,
    pub current_jobs: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_status_with_no_other_fields_is_a_heartbeat() {
        let msg = StatusUpdateEnvelope {
            correlation_id: OccurrenceId::new(),
            job_id: JobId::new(),
            worker_id: None,
            status: OccurrenceStatus::Running,
            start_time: None,
            end_time: None,
            duration_ms: None,
            result: None,
            exception: None,
        };
        assert!(msg.is_heartbeat_only());
    }

    #[test]
    fn running_status_with_start_time_is_not_a_heartbeat() {
        let msg = StatusUpdateEnvelope {
            correlation_id: OccurrenceId::new(),
            job_id: JobId::new(),
            worker_id: None,
            status: OccurrenceStatus::Running,
            start_time: Some(Utc::now()),
            end_time: None,
            duration_ms: None,
            result: None,
            exception: None,
        };
        assert!(!msg.is_heartbeat_only());
    }
}
