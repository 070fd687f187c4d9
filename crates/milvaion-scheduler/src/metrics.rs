//! Metric names and recorder structs for every long-running component
//! (C5-C10). Grounded in the source's `arcana-jobs/src/metrics.rs`: a
//! `names` module of string constants, a `register_metrics()` that
//! describes each one, and one recorder struct per component exposing
//! static methods over the `counter!`/`gauge!`/`histogram!` macros.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Metric name constants, namespaced `milvaion_<component>_<thing>` the
/// way the source namespaces `arcana_jobs_*`.
pub mod names {
    pub const DISPATCHER_ITERATIONS_TOTAL: &str = "milvaion_dispatcher_iterations_total";
    pub const DISPATCHER_DUE_JOBS_TOTAL: &str = "milvaion_dispatcher_due_jobs_total";
    pub const DISPATCHER_PUBLISHED_TOTAL: &str = "milvaion_dispatcher_published_total";
    pub const DISPATCHER_SKIPPED_TOTAL: &str = "milvaion_dispatcher_skipped_total";
    pub const DISPATCHER_LOCK_CONTENDED_TOTAL: &str = "milvaion_dispatcher_lock_contended_total";
    pub const DISPATCHER_RETRY_SWEEP_TOTAL: &str = "milvaion_dispatcher_retry_sweep_total";
    pub const DISPATCHER_CONSECUTIVE_FAILURES: &str = "milvaion_dispatcher_consecutive_failures";
    pub const DISPATCHER_ITERATION_DURATION_SECONDS: &str = "milvaion_dispatcher_iteration_duration_seconds";

    pub const STATUS_TRACKER_MESSAGES_TOTAL: &str = "milvaion_status_tracker_messages_total";
    pub const STATUS_TRACKER_BATCH_SIZE: &str = "milvaion_status_tracker_batch_size";
    pub const STATUS_TRACKER_BATCH_FLUSH_SECONDS: &str = "milvaion_status_tracker_batch_flush_seconds";
    pub const STATUS_TRACKER_AUTO_DISABLED_TOTAL: &str = "milvaion_status_tracker_auto_disabled_total";

    pub const LOG_COLLECTOR_LOGS_TOTAL: &str = "milvaion_log_collector_logs_total";
    pub const LOG_COLLECTOR_BATCH_SIZE: &str = "milvaion_log_collector_batch_size";
    pub const LOG_COLLECTOR_BATCH_FLUSH_SECONDS: &str = "milvaion_log_collector_batch_flush_seconds";

    pub const ZOMBIE_DETECTOR_SWEEPS_TOTAL: &str = "milvaion_zombie_detector_sweeps_total";
    pub const ZOMBIE_DETECTOR_ZOMBIES_TOTAL: &str = "milvaion_zombie_detector_zombies_total";
    pub const ZOMBIE_DETECTOR_WORKERS_EVICTED_TOTAL: &str = "milvaion_zombie_detector_workers_evicted_total";

    pub const FAILED_OCCURRENCE_PROCESSED_TOTAL: &str = "milvaion_failed_occurrence_processed_total";

    pub const WORKER_REGISTRY_ACTIVE_WORKERS: &str = "milvaion_worker_registry_active_workers";
    pub const WORKER_REGISTRY_REGISTRATIONS_TOTAL: &str = "milvaion_worker_registry_registrations_total";
    pub const WORKER_REGISTRY_HEARTBEATS_TOTAL: &str = "milvaion_worker_registry_heartbeats_total";

    pub const CIRCUIT_BREAKER_OPEN: &str = "milvaion_circuit_breaker_open";
}

/// Registers descriptions for every metric name above. Called once at
/// start-up before any recorder method runs (description-after-first-use
/// is silently ignored by the `metrics` facade, so order matters).
pub fn register_metrics() {
    use names::*;

    describe_counter!(DISPATCHER_ITERATIONS_TOTAL, "dispatcher poll iterations completed");
    describe_counter!(DISPATCHER_DUE_JOBS_TOTAL, "jobs observed due for dispatch");
    describe_counter!(DISPATCHER_PUBLISHED_TOTAL, "occurrences published to the bus");
    describe_counter!(DISPATCHER_SKIPPED_TOTAL, "due jobs skipped this iteration, by reason");
    describe_counter!(DISPATCHER_LOCK_CONTENDED_TOTAL, "dispatch attempts that lost the per-job lock race");
    describe_counter!(DISPATCHER_RETRY_SWEEP_TOTAL, "occurrences picked up by the dispatch-retry sweep");
    describe_gauge!(DISPATCHER_CONSECUTIVE_FAILURES, "consecutive failed dispatcher iterations");
    describe_histogram!(DISPATCHER_ITERATION_DURATION_SECONDS, "wall time of one dispatcher iteration");

    describe_counter!(STATUS_TRACKER_MESSAGES_TOTAL, "status update messages consumed, by status");
    describe_histogram!(STATUS_TRACKER_BATCH_SIZE, "occurrences flushed per status tracker batch");
    describe_histogram!(STATUS_TRACKER_BATCH_FLUSH_SECONDS, "time to flush one status tracker batch");
    describe_counter!(STATUS_TRACKER_AUTO_DISABLED_TOTAL, "jobs auto-disabled after consecutive failures");

    describe_counter!(LOG_COLLECTOR_LOGS_TOTAL, "log entries consumed");
    describe_histogram!(LOG_COLLECTOR_BATCH_SIZE, "log entries flushed per batch");
    describe_histogram!(LOG_COLLECTOR_BATCH_FLUSH_SECONDS, "time to flush one log collector batch");

    describe_counter!(ZOMBIE_DETECTOR_SWEEPS_TOTAL, "zombie detector sweeps completed");
    describe_counter!(ZOMBIE_DETECTOR_ZOMBIES_TOTAL, "occurrences marked as zombies");
    describe_counter!(ZOMBIE_DETECTOR_WORKERS_EVICTED_TOTAL, "stale worker instances evicted");

    describe_counter!(FAILED_OCCURRENCE_PROCESSED_TOTAL, "DLQ messages processed, by failure type");

    describe_gauge!(WORKER_REGISTRY_ACTIVE_WORKERS, "workers with a live heartbeat");
    describe_counter!(WORKER_REGISTRY_REGISTRATIONS_TOTAL, "worker registration messages consumed");
    describe_counter!(WORKER_REGISTRY_HEARTBEATS_TOTAL, "worker heartbeat messages consumed");

    describe_gauge!(CIRCUIT_BREAKER_OPEN, "1 if the named circuit breaker is open, else 0");
}

pub struct DispatcherMetrics;

impl DispatcherMetrics {
    pub fn iteration_completed(duration_secs: f64) {
        counter!(names::DISPATCHER_ITERATIONS_TOTAL).increment(1);
        histogram!(names::DISPATCHER_ITERATION_DURATION_SECONDS).record(duration_secs);
    }

    pub fn due_jobs_observed(count: u64) {
        counter!(names::DISPATCHER_DUE_JOBS_TOTAL).increment(count);
    }

    pub fn published() {
        counter!(names::DISPATCHER_PUBLISHED_TOTAL).increment(1);
    }

    pub fn skipped(reason: &'static str) {
        counter!(names::DISPATCHER_SKIPPED_TOTAL, "reason" => reason).increment(1);
    }

    pub fn lock_contended() {
        counter!(names::DISPATCHER_LOCK_CONTENDED_TOTAL).increment(1);
    }

    pub fn retry_sweep_picked_up(count: u64) {
        counter!(names::DISPATCHER_RETRY_SWEEP_TOTAL).increment(count);
    }

    pub fn consecutive_failures(n: u32) {
        gauge!(names::DISPATCHER_CONSECUTIVE_FAILURES).set(f64::from(n));
    }
}

pub struct StatusTrackerMetrics;

impl StatusTrackerMetrics {
    pub fn message_received(status: &'static str) {
        counter!(names::STATUS_TRACKER_MESSAGES_TOTAL, "status" => status).increment(1);
    }

    pub fn batch_flushed(size: usize, duration_secs: f64) {
        histogram!(names::STATUS_TRACKER_BATCH_SIZE).record(size as f64);
        histogram!(names::STATUS_TRACKER_BATCH_FLUSH_SECONDS).record(duration_secs);
    }

    pub fn job_auto_disabled() {
        counter!(names::STATUS_TRACKER_AUTO_DISABLED_TOTAL).increment(1);
    }
}

pub struct LogCollectorMetrics;

impl LogCollectorMetrics {
    pub fn log_received() {
        counter!(names::LOG_COLLECTOR_LOGS_TOTAL).increment(1);
    }

    pub fn batch_flushed(size: usize, duration_secs: f64) {
        histogram!(names::LOG_COLLECTOR_BATCH_SIZE).record(size as f64);
        histogram!(names::LOG_COLLECTOR_BATCH_FLUSH_SECONDS).record(duration_secs);
    }
}

pub struct ZombieDetectorMetrics;

impl ZombieDetectorMetrics {
    pub fn sweep_completed(zombies_found: u64, workers_evicted: u64) {
        counter!(names::ZOMBIE_DETECTOR_SWEEPS_TOTAL).increment(1);
        counter!(names::ZOMBIE_DETECTOR_ZOMBIES_TOTAL).increment(zombies_found);
        counter!(names::ZOMBIE_DETECTOR_WORKERS_EVICTED_TOTAL).increment(workers_evicted);
    }
}

pub struct FailedOccurrenceMetrics;

impl FailedOccurrenceMetrics {
    pub fn processed(failure_type: &'static str) {
        counter!(names::FAILED_OCCURRENCE_PROCESSED_TOTAL, "failure_type" => failure_type).increment(1);
    }
}

pub struct WorkerRegistryMetrics;

impl WorkerRegistryMetrics {
    pub fn active_workers(count: u64) {
        gauge!(names::WORKER_REGISTRY_ACTIVE_WORKERS).set(count as f64);
    }

    pub fn registration_received() {
        counter!(names::WORKER_REGISTRY_REGISTRATIONS_TOTAL).increment(1);
    }

    pub fn heartbeat_received() {
        counter!(names::WORKER_REGISTRY_HEARTBEATS_TOTAL).increment(1);
    }
}

pub struct CircuitBreakerMetrics;

impl CircuitBreakerMetrics {
    pub fn state_changed(name: &str, open: bool) {
        gauge!(names::CIRCUIT_BREAKER_OPEN, "breaker" => name.to_string()).set(if open { 1.0 } else { 0.0 });
    }
}
