//! The worker registry aggregate — unlike `ScheduledJob`/`JobOccurrence`/
//! `FailedOccurrence`, this one is never persisted relationally: it lives
//! entirely in the KV store (C3) as one hash per `workerId`, per §3.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of one worker instance, as reported at registration
/// time and implied by heartbeat/eviction afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerInstanceStatus {
    Online,
    Draining,
    Offline,
}

/// Per-consumer capacity configuration: how many of `job_name_in_worker`'s
/// occurrences this worker group will run at once, and what the worker
/// side considers a hung execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub job_name_in_worker: String,
    /// `None` means unbounded (worker-capacity gate always passes).
    pub max_parallel_jobs: Option<u32>,
    pub execution_timeout_seconds: Option<u32>,
}

/// One live worker process, as announced over the registration channel and
/// kept alive by its heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInstance {
    pub instance_id: String,
    pub host_name: String,
    pub ip_address: String,
    /// Sum of in-flight occurrences this instance is currently running,
    /// reported on each heartbeat.
    pub current_jobs: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub status: WorkerInstanceStatus,
}

impl WorkerInstance {
    /// Whether this instance's heartbeat is older than `ttl`.
    #[must_use]
    pub fn is_stale(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat > ttl
    }
}

/// The full registration state of one logical worker group (`workerId`):
/// its live instances plus the group-wide and per-consumer capacity
/// configuration the dispatcher's worker-capacity gate (§4.5 step 6)
/// reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAggregate {
    pub worker_id: String,
    pub instances: Vec<WorkerInstance>,
    /// `None` means unbounded at the group level; only the per-consumer
    /// bound (if any) applies.
    pub max_parallel_jobs: Option<u32>,
    pub consumers: Vec<ConsumerConfig>,
}

impl WorkerAggregate {
    #[must_use]
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            instances: Vec::new(),
            max_parallel_jobs: None,
            consumers: Vec::new(),
        }
    }

    /// Inserts a newly registered instance, replacing any existing entry
    /// with the same id (a worker re-registering after a reconnect).
    /// Idempotent per spec §4.3.
    pub fn upsert_instance(&mut self, instance: WorkerInstance) {
        self.instances.retain(|i| i.instance_id != instance.instance_id);
        self.instances.push(instance);
    }

    /// Records a heartbeat for `instance_id`, if known. Returns `false` if
    /// the instance was never registered — the caller (C10) logs a warning
    /// and does not auto-create, per §4.3.
    pub fn touch(&mut self, instance_id: &str, current_jobs: u32, at: DateTime<Utc>) -> bool {
        if let Some(instance) = self.instances.iter_mut().find(|i| i.instance_id == instance_id) {
            instance.last_heartbeat = at;
            instance.current_jobs = current_jobs;
            true
        } else {
            false
        }
    }

    /// Removes instances whose heartbeat has exceeded `ttl`, returning
    /// their instance ids.
    pub fn evict_stale(&mut self, ttl: chrono::Duration, now: DateTime<Utc>) -> Vec<String> {
        let (stale, fresh): (Vec<_>, Vec<_>) =
            self.instances.drain(..).partition(|i| i.is_stale(ttl, now));
        self.instances = fresh;
        stale.into_iter().map(|i| i.instance_id).collect()
    }

    /// True iff at least one instance has a heartbeat within `ttl` of
    /// `now` — the worker-capacity gate's "worker must be active" check
    /// (§4.3 `isWorkerActive`).
    #[must_use]
    pub fn is_active(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.instances.iter().any(|i| !i.is_stale(ttl, now))
    }

    /// Aggregate `currentJobs` across all instances (§4.3 `getWorkerCapacity`).
    #[must_use]
    pub fn current_jobs(&self) -> u32 {
        self.instances.iter().map(|i| i.current_jobs).sum()
    }

    /// The capacity configuration for one consumer binding, if registered.
    #[must_use]
    pub fn consumer(&self, job_name_in_worker: &str) -> Option<&ConsumerConfig> {
        self.consumers
            .iter()
            .find(|c| c.job_name_in_worker == job_name_in_worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_instance(id: &str, heartbeat: DateTime<Utc>) -> WorkerInstance {
        WorkerInstance {
            instance_id: id.into(),
            host_name: "host-a".into(),
            ip_address: "10.0.0.5".into(),
            current_jobs: 2,
            last_heartbeat: heartbeat,
            registered_at: heartbeat,
            status: WorkerInstanceStatus::Online,
        }
    }

    #[test]
    fn upsert_replaces_existing_instance_with_same_id() {
        let mut agg = WorkerAggregate::new("email-workers");
        agg.upsert_instance(sample_instance("i1", Utc::now()));
        agg.upsert_instance(sample_instance("i1", Utc::now()));
        assert_eq!(agg.instances.len(), 1);
    }

    #[test]
    fn touch_returns_false_for_unknown_instance() {
        let mut agg = WorkerAggregate::new("email-workers");
        assert!(!agg.touch("ghost", 0, Utc::now()));
    }

    #[test]
    fn touch_updates_heartbeat_and_current_jobs() {
        let mut agg = WorkerAggregate::new("email-workers");
        agg.upsert_instance(sample_instance("i1", Utc::now() - chrono::Duration::minutes(5)));
        let now = Utc::now();
        assert!(agg.touch("i1", 7, now));
        assert_eq!(agg.instances[0].current_jobs, 7);
        assert_eq!(agg.instances[0].last_heartbeat, now);
    }

    #[test]
    fn evict_stale_removes_instances_past_ttl() {
        let mut agg = WorkerAggregate::new("email-workers");
        let old = Utc::now() - chrono::Duration::minutes(10);
        agg.upsert_instance(sample_instance("stale", old));
        agg.upsert_instance(sample_instance("fresh", Utc::now()));
        let evicted = agg.evict_stale(chrono::Duration::minutes(1), Utc::now());
        assert_eq!(evicted, vec!["stale".to_string()]);
        assert_eq!(agg.instances.len(), 1);
        assert_eq!(agg.instances[0].instance_id, "fresh");
    }

    #[test]
    fn is_active_requires_at_least_one_fresh_instance() {
        let mut agg = WorkerAggregate::new("email-workers");
        assert!(!agg.is_active(chrono::Duration::minutes(1), Utc::now()));
        agg.upsert_instance(sample_instance("i1", Utc::now()));
        assert!(agg.is_active(chrono::Duration::minutes(1), Utc::now()));
    }

    #[test]
    fn current_jobs_sums_across_instances() {
        let mut agg = WorkerAggregate::new("email-workers");
        agg.upsert_instance(sample_instance("i1", Utc::now()));
        agg.upsert_instance(sample_instance("i2", Utc::now()));
        assert_eq!(agg.current_jobs(), 4);
    }

    #[test]
    fn consumer_lookup_finds_registered_binding() {
        let mut agg = WorkerAggregate::new("email-workers");
        agg.consumers.push(ConsumerConfig {
            job_name_in_worker: "sendemail".into(),
            max_parallel_jobs: Some(10),
            execution_timeout_seconds: Some(300),
        });
        assert!(agg.consumer("sendemail").is_some());
        assert!(agg.consumer("unknown").is_none());
    }
}
