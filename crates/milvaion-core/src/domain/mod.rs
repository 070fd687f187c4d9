//! Durable domain entities owned exclusively by the scheduler, plus the
//! ephemeral worker-registry aggregate that lives only in the KV store.

mod failed_occurrence;
mod occurrence;
mod scheduled_job;
mod worker;

pub use failed_occurrence::{FailedOccurrence, FailureType};
pub use occurrence::{
    truncate_exception, JobOccurrence, LogEntry, LogLevel, OccurrenceStatus, StatusChange,
};
pub use scheduled_job::{AutoDisableSettings, ConcurrencyPolicy, ScheduledJob};
pub use worker::{ConsumerConfig, WorkerAggregate, WorkerInstance, WorkerInstanceStatus};
