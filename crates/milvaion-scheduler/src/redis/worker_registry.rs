//! Redis worker registry (C3): register/heartbeat/capacity, grounded in
//! the source's `worker_registry.rs` for the shape of a worker's
//! aggregate, but backed by Redis (one key per `workerId`, plus separate
//! `consumer:{workerId}:{jobName}` counters) instead of an in-process
//! `RwLock<HashMap<...>>`, since multiple dispatcher/status-tracker
//! processes must observe the same state.

use chrono::{Duration as ChronoDuration, Utc};
use deadpool_redis::Pool;
use milvaion_core::{ConsumerConfig, MilvaionError, MilvaionResult, WorkerAggregate, WorkerInstance};
use redis::AsyncCommands;
use tracing::warn;

use super::RedisKeys;

/// Atomically decrements a counter, flooring at zero — spec §4.3
/// "never negative".
const DECR_FLOOR_ZERO_SCRIPT: &str = r"
local current = tonumber(redis.call('get', KEYS[1]) or '0')
if current <= 0 then
    redis.call('set', KEYS[1], '0')
    return 0
end
return redis.call('decr', KEYS[1])
";

pub struct WorkerRegistry {
    pool: Pool,
    keys: RedisKeys,
}

impl WorkerRegistry {
    #[must_use]
    pub fn new(pool: Pool, key_prefix: impl Into<String>) -> Self {
        Self { pool, keys: RedisKeys::new(key_prefix) }
    }

    async fn conn(&self) -> MilvaionResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| MilvaionError::Kv(format!("failed to acquire redis connection: {e}")))
    }

    async fn load(&self, worker_id: &str) -> MilvaionResult<Option<WorkerAggregate>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .get(self.keys.worker(worker_id))
            .await
            .map_err(|e| MilvaionError::Kv(e.to_string()))?;
        match raw {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| MilvaionError::Internal(format!("corrupt worker aggregate for {worker_id}: {e}"))),
        }
    }

    async fn save(&self, aggregate: &WorkerAggregate) -> MilvaionResult<()> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(aggregate)?;
        let _: () = conn
            .set(self.keys.worker(&aggregate.worker_id), payload)
            .await
            .map_err(|e| MilvaionError::Kv(e.to_string()))?;
        Ok(())
    }

    /// `registerWorker(registration)` — upserts the aggregate, merging the
    /// reporting instance by `instanceId` and replacing the group-wide
    /// capacity config with the latest registration. Idempotent on
    /// re-registration.
    pub async fn register_worker(
        &self,
        worker_id: &str,
        instance: WorkerInstance,
        max_parallel_jobs: Option<u32>,
        consumers: Vec<ConsumerConfig>,
    ) -> MilvaionResult<()> {
        let mut aggregate = self.load(worker_id).await?.unwrap_or_else(|| WorkerAggregate::new(worker_id));
        aggregate.upsert_instance(instance);
        aggregate.max_parallel_jobs = max_parallel_jobs;
        aggregate.consumers = consumers;
        self.save(&aggregate).await
    }

    /// `updateHeartbeat(workerId, instanceId, currentJobs)` — returns
    /// `false` (and logs a warning) when the worker or instance is unknown;
    /// the caller does not auto-create.
    pub async fn update_heartbeat(&self, worker_id: &str, instance_id: &str, current_jobs: u32) -> MilvaionResult<bool> {
        let Some(mut aggregate) = self.load(worker_id).await? else {
            warn!(worker_id, instance_id, "heartbeat for unknown worker, ignoring");
            return Ok(false);
        };
        let touched = aggregate.touch(instance_id, current_jobs, Utc::now());
        if !touched {
            warn!(worker_id, instance_id, "heartbeat for unknown instance, ignoring");
            return Ok(false);
        }
        self.save(&aggregate).await?;
        Ok(true)
    }

    /// `isWorkerActive(workerId)` — true iff at least one instance has a
    /// heartbeat within `ttl`.
    pub async fn is_worker_active(&self, worker_id: &str, ttl: ChronoDuration) -> MilvaionResult<bool> {
        Ok(self
            .load(worker_id)
            .await?
            .is_some_and(|aggregate| aggregate.is_active(ttl, Utc::now())))
    }

    /// `getWorkerCapacity(workerId)` -> `(currentJobs, maxParallelJobs?)`.
    pub async fn get_worker_capacity(&self, worker_id: &str) -> MilvaionResult<(u32, Option<u32>)> {
        match self.load(worker_id).await? {
            Some(aggregate) => Ok((aggregate.current_jobs(), aggregate.max_parallel_jobs)),
            None => Ok((0, None)),
        }
    }

    /// `getConsumerCapacity(workerId, jobName)` -> `(currentJobs,
    /// maxParallelJobs?)`; the counter is maintained by the status tracker,
    /// the bound comes from the worker's registered consumer config.
    pub async fn get_consumer_capacity(&self, worker_id: &str, job_name: &str) -> MilvaionResult<(u32, Option<u32>)> {
        let mut conn = self.conn().await?;
        let current: Option<u32> = conn
            .get(self.keys.consumer(worker_id, job_name))
            .await
            .map_err(|e| MilvaionError::Kv(e.to_string()))?;
        let max = self
            .load(worker_id)
            .await?
            .and_then(|aggregate| aggregate.consumer(job_name).and_then(|c| c.max_parallel_jobs));
        Ok((current.unwrap_or(0), max))
    }

    /// `incrementConsumerJobCount(workerId, jobName)` — atomic `INCR`.
    pub async fn increment_consumer_job_count(&self, worker_id: &str, job_name: &str) -> MilvaionResult<()> {
        let mut conn = self.conn().await?;
        let _: i64 = conn
            .incr(self.keys.consumer(worker_id, job_name), 1)
            .await
            .map_err(|e| MilvaionError::Kv(e.to_string()))?;
        Ok(())
    }

    /// `decrementConsumerJobCount(workerId, jobName)` — atomic, floored at
    /// zero.
    pub async fn decrement_consumer_job_count(&self, worker_id: &str, job_name: &str) -> MilvaionResult<()> {
        let mut conn = self.conn().await?;
        let _: i64 = redis::Script::new(DECR_FLOOR_ZERO_SCRIPT)
            .key(self.keys.consumer(worker_id, job_name))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| MilvaionError::Kv(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decr_floor_script_never_goes_negative() {
        assert!(DECR_FLOOR_ZERO_SCRIPT.contains("current <= 0"));
    }
}
