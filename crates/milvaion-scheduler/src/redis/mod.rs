//! The Redis-backed half of the control plane: the time index and job
//! cache (C1), fenced per-job locks (C2), and the worker registry (C3).
//! Grounded in the source's `redis/mod.rs` (`RedisKeys`, pool setup with a
//! `PING` health check) and `redis/queue.rs` (pipelined sorted-set ops).

mod lock_service;
mod scheduler_client;
mod worker_registry;

pub use lock_service::LockService;
pub use scheduler_client::{CachedJob, SchedulerClient};
pub use worker_registry::WorkerRegistry;

use deadpool_redis::{Config, Pool, Runtime};
use milvaion_core::{MilvaionError, MilvaionResult};
use tracing::info;

/// Creates a pooled Redis connection, mirroring the source's
/// `redis::create_pool` (max-size from config, Tokio runtime, a `PING`
/// probe before returning the pool to the caller).
pub async fn create_pool(url: &str, pool_size: usize) -> MilvaionResult<Pool> {
    info!("creating Redis connection pool");

    let cfg = Config::from_url(url);
    let pool = cfg
        .builder()
        .map_err(|e| MilvaionError::Configuration(format!("invalid redis config: {e}")))?
        .max_size(pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| MilvaionError::Configuration(format!("failed to build redis pool: {e}")))?;

    let mut conn = pool
        .get()
        .await
        .map_err(|e| MilvaionError::Kv(format!("failed to acquire redis connection: {e}")))?;
    redis::cmd("PING")
        .query_async::<String>(&mut conn)
        .await
        .map_err(|e| MilvaionError::Kv(format!("redis PING failed: {e}")))?;

    info!("Redis connection pool created");
    Ok(pool)
}

/// Key builder for every entry in the KV layout (spec §6): the job-score
/// index, cached job projections, fenced locks, running markers, the
/// worker registry, and the cancellation pub/sub channel. All keys share
/// one configurable prefix (default `JobScheduler:`).
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// `{p}scheduled_jobs` — sorted set of job ids by fire-time epoch.
    #[must_use]
    pub fn scheduled_jobs(&self) -> String {
        format!("{}scheduled_jobs", self.prefix)
    }

    /// `{p}job:{jobId}` — cached job projection.
    #[must_use]
    pub fn job(&self, job_id: impl std::fmt::Display) -> String {
        format!("{}job:{job_id}", self.prefix)
    }

    /// `{p}lock:{jobId}` — fenced per-job dispatch lock.
    #[must_use]
    pub fn lock(&self, job_id: impl std::fmt::Display) -> String {
        format!("{}lock:{job_id}", self.prefix)
    }

    /// `{p}running:{jobId}` — running marker, value = correlation id.
    #[must_use]
    pub fn running(&self, job_id: impl std::fmt::Display) -> String {
        format!("{}running:{job_id}", self.prefix)
    }

    /// `{p}worker:{workerId}` — hash of the worker aggregate.
    #[must_use]
    pub fn worker(&self, worker_id: &str) -> String {
        format!("{}worker:{worker_id}", self.prefix)
    }

    /// `{p}consumer:{workerId}:{jobName}` — per-consumer job counter.
    #[must_use]
    pub fn consumer(&self, worker_id: &str, job_name: &str) -> String {
        format!("{}consumer:{worker_id}:{job_name}", self.prefix)
    }

    /// `{p}cancellation_channel` — pub/sub channel for user-initiated
    /// cancellation.
    #[must_use]
    pub fn cancellation_channel(&self) -> String {
        format!("{}cancellation_channel", self.prefix)
    }

    /// `{p}emergency_stop` — runtime flag checked at the top of every
    /// dispatcher iteration (§4.5 step 1); set out-of-band by the (out of
    /// scope) admin surface, never written by the scheduler itself.
    #[must_use]
    pub fn emergency_stop(&self) -> String {
        format!("{}emergency_stop", self.prefix)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("JobScheduler:")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_share_the_configured_prefix() {
        let keys = RedisKeys::new("Test:");
        assert_eq!(keys.scheduled_jobs(), "Test:scheduled_jobs");
        assert_eq!(keys.job("j1"), "Test:job:j1");
        assert_eq!(keys.lock("j1"), "Test:lock:j1");
        assert_eq!(keys.running("j1"), "Test:running:j1");
        assert_eq!(keys.worker("w1"), "Test:worker:w1");
        assert_eq!(keys.consumer("w1", "sendemail"), "Test:consumer:w1:sendemail");
    }

    #[test]
    fn default_prefix_matches_spec() {
        assert_eq!(RedisKeys::default().scheduled_jobs(), "JobScheduler:scheduled_jobs");
    }
}
