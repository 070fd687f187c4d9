//! Redis scheduler client (C1): the time-sorted job index, a read-through
//! cache of dispatch-sufficient job projections, and the running-marker
//! primitives the dispatcher's concurrency gate depends on.

use chrono::{DateTime, Utc};
use deadpool_redis::Pool;
use milvaion_core::{ConcurrencyPolicy, JobId, MilvaionError, MilvaionResult, OccurrenceId, ScheduledJob};
use milvaion_resilience::{CircuitBreaker, CircuitBreakerConfig};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use super::RedisKeys;

/// A projection of `ScheduledJob` sufficient for dispatch. Deliberately
/// omits `execute_at` — the sorted-set index is the single source of
/// truth for fire time, per DESIGN NOTES in spec §9.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedJob {
    pub id: JobId,
    pub display_name: String,
    pub job_name_in_worker: String,
    pub worker_id: Option<String>,
    pub job_data: String,
    pub is_active: bool,
    pub concurrent_execution_policy: ConcurrencyPolicy,
    pub execution_timeout_seconds: u32,
    pub zombie_timeout_minutes: Option<u32>,
    pub version: u64,
    pub cron_expression: Option<String>,
}

impl From<&ScheduledJob> for CachedJob {
    fn from(job: &ScheduledJob) -> Self {
        Self {
            id: job.id,
            display_name: job.display_name.clone(),
            job_name_in_worker: job.job_name_in_worker.clone(),
            worker_id: job.worker_id.clone(),
            job_data: job.job_data.clone(),
            is_active: job.is_active,
            concurrent_execution_policy: job.concurrent_execution_policy,
            execution_timeout_seconds: job.execution_timeout_seconds,
            zombie_timeout_minutes: job.zombie_timeout_minutes,
            version: job.version,
            cron_expression: job.cron_expression.clone(),
        }
    }
}

/// Default cache TTL for job projections (24h, per spec §6 KV layout).
const JOB_CACHE_TTL_SECS: u64 = 24 * 60 * 60;

pub struct SchedulerClient {
    pool: Pool,
    keys: RedisKeys,
    breaker: CircuitBreaker,
}

impl SchedulerClient {
    #[must_use]
    pub fn new(pool: Pool, key_prefix: impl Into<String>, breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(key_prefix),
            breaker: CircuitBreaker::new("redis-scheduler-client", breaker_config),
        }
    }

    async fn conn(&self) -> MilvaionResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| MilvaionError::Kv(format!("failed to acquire redis connection: {e}")))
    }

    async fn guarded<F, Fut, T>(&self, op: F) -> MilvaionResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = MilvaionResult<T>>,
    {
        self.breaker.call(op).await.map_err(MilvaionError::from)
    }

    /// `addToScheduledSet` / `updateSchedule` — both are a plain `ZADD`;
    /// Redis treats re-adding an existing member as a score update.
    pub async fn add_to_scheduled_set(&self, job_id: JobId, fire_at: DateTime<Utc>) -> MilvaionResult<()> {
        self.guarded(|| async {
            let mut conn = self.conn().await?;
            let _: () = conn
                .zadd(self.keys.scheduled_jobs(), job_id.to_string(), fire_at.timestamp())
                .await
                .map_err(|e| MilvaionError::Kv(e.to_string()))?;
            Ok(())
        })
        .await
    }

    pub async fn remove_from_scheduled_set(&self, job_id: JobId) -> MilvaionResult<()> {
        self.guarded(|| async {
            let mut conn = self.conn().await?;
            let _: () = conn
                .zrem(self.keys.scheduled_jobs(), job_id.to_string())
                .await
                .map_err(|e| MilvaionError::Kv(e.to_string()))?;
            Ok(())
        })
        .await
    }

    /// `getDueJobs(now, maxN)` — ids with score <= now, ascending, capped at
    /// `max_n`.
    pub async fn get_due_jobs(&self, now: DateTime<Utc>, max_n: usize) -> MilvaionResult<Vec<JobId>> {
        self.guarded(|| async {
            let mut conn = self.conn().await?;
            let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(self.keys.scheduled_jobs())
                .arg(0i64)
                .arg(now.timestamp())
                .arg("LIMIT")
                .arg(0)
                .arg(max_n)
                .query_async(&mut conn)
                .await
                .map_err(|e| MilvaionError::Kv(e.to_string()))?;
            Ok(parse_job_ids(ids))
        })
        .await
    }

    /// `getScheduledTime(jobId)` — the authoritative fire time.
    pub async fn get_scheduled_time(&self, job_id: JobId) -> MilvaionResult<Option<DateTime<Utc>>> {
        let bulk = self.get_scheduled_times_bulk(&[job_id]).await?;
        Ok(bulk.into_values().next())
    }

    /// `getScheduledTimesBulk(ids)` — pipelined `ZSCORE` lookups so the
    /// dispatcher can overlay `executeAt` on a batch without N round-trips.
    pub async fn get_scheduled_times_bulk(
        &self,
        ids: &[JobId],
    ) -> MilvaionResult<HashMap<JobId, DateTime<Utc>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        self.guarded(|| async {
            let mut conn = self.conn().await?;
            let mut pipe = redis::pipe();
            for id in ids {
                pipe.zscore(self.keys.scheduled_jobs(), id.to_string());
            }
            let scores: Vec<Option<f64>> = pipe
                .query_async(&mut conn)
                .await
                .map_err(|e| MilvaionError::Kv(e.to_string()))?;
            let mut out = HashMap::with_capacity(ids.len());
            for (id, score) in ids.iter().zip(scores) {
                if let Some(score) = score {
                    if let Some(dt) = DateTime::from_timestamp(score as i64, 0) {
                        out.insert(*id, dt);
                    }
                }
            }
            Ok(out)
        })
        .await
    }

    /// `cacheJobDetails(job, ttl)` — writes a dispatch-sufficient projection.
    pub async fn cache_job_details(&self, job: &ScheduledJob) -> MilvaionResult<()> {
        let cached = CachedJob::from(job);
        let payload = serde_json::to_string(&cached)?;
        self.guarded(|| async {
            let mut conn = self.conn().await?;
            let _: () = conn
                .set_ex(self.keys.job(job.id), payload, JOB_CACHE_TTL_SECS)
                .await
                .map_err(|e| MilvaionError::Kv(e.to_string()))?;
            Ok(())
        })
        .await
    }

    /// `getCachedJobsBulk(ids)` — pipelined `MGET`, skipping ids with no
    /// cached entry (the caller falls back to the store for misses).
    pub async fn get_cached_jobs_bulk(&self, ids: &[JobId]) -> MilvaionResult<HashMap<JobId, CachedJob>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        self.guarded(|| async {
            let mut conn = self.conn().await?;
            let keys: Vec<String> = ids.iter().map(|id| self.keys.job(*id)).collect();
            let values: Vec<Option<String>> = conn
                .mget(keys)
                .await
                .map_err(|e| MilvaionError::Kv(e.to_string()))?;
            let mut out = HashMap::with_capacity(ids.len());
            for (id, value) in ids.iter().zip(values) {
                if let Some(raw) = value {
                    match serde_json::from_str::<CachedJob>(&raw) {
                        Ok(cached) => {
                            out.insert(*id, cached);
                        }
                        Err(e) => warn!(job_id = %id, error = %e, "dropping unparsable cached job entry"),
                    }
                }
            }
            Ok(out)
        })
        .await
    }

    pub async fn remove_cached_job(&self, job_id: JobId) -> MilvaionResult<()> {
        self.guarded(|| async {
            let mut conn = self.conn().await?;
            let _: () = conn
                .del(self.keys.job(job_id))
                .await
                .map_err(|e| MilvaionError::Kv(e.to_string()))?;
            Ok(())
        })
        .await
    }

    /// `tryMarkJobAsRunning(jobId, correlationId)` — atomic `SET NX` of the
    /// running marker; `ttl` should be at least the job's execution
    /// timeout per spec §4.1.
    pub async fn try_mark_job_as_running(
        &self,
        job_id: JobId,
        correlation_id: OccurrenceId,
        ttl: Duration,
    ) -> MilvaionResult<bool> {
        self.guarded(|| async {
            let mut conn = self.conn().await?;
            let set: Option<String> = redis::cmd("SET")
                .arg(self.keys.running(job_id))
                .arg(correlation_id.to_string())
                .arg("NX")
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query_async(&mut conn)
                .await
                .map_err(|e| MilvaionError::Kv(e.to_string()))?;
            Ok(set.is_some())
        })
        .await
    }

    /// `markJobAsCompleted(jobId)` — idempotent marker clear.
    pub async fn mark_job_as_completed(&self, job_id: JobId) -> MilvaionResult<()> {
        self.guarded(|| async {
            let mut conn = self.conn().await?;
            let _: () = conn
                .del(self.keys.running(job_id))
                .await
                .map_err(|e| MilvaionError::Kv(e.to_string()))?;
            Ok(())
        })
        .await
    }

    /// Every job id currently present in the time index, used by start-up
    /// recovery's reconcile pass (§4.5 step 2) to find entries that no
    /// longer correspond to an active store row.
    pub async fn get_all_scheduled_job_ids(&self) -> MilvaionResult<Vec<JobId>> {
        self.guarded(|| async {
            let mut conn = self.conn().await?;
            let ids: Vec<String> = conn
                .zrange(self.keys.scheduled_jobs(), 0, -1)
                .await
                .map_err(|e| MilvaionError::Kv(e.to_string()))?;
            Ok(parse_job_ids(ids))
        })
        .await
    }

    /// Publishes a user-initiated cancellation notice on the pub/sub
    /// cancellation channel (§6). Workers are expected to subscribe and
    /// cooperate; the scheduler itself never initiates a cancel, so this
    /// exists purely as the write side of the KV layout's contract.
    pub async fn publish_cancellation(&self, correlation_id: OccurrenceId) -> MilvaionResult<()> {
        self.guarded(|| async {
            let mut conn = self.conn().await?;
            let _: i64 = conn
                .publish(self.keys.cancellation_channel(), correlation_id.to_string())
                .await
                .map_err(|e| MilvaionError::Kv(e.to_string()))?;
            Ok(())
        })
        .await
    }

    /// Checks the runtime "emergency stop" flag (§4.5 step 1): when set,
    /// the dispatcher's main loop skips straight to the next poll tick
    /// without querying the time index. The scheduler never sets this
    /// itself — it is an out-of-band admin lever.
    pub async fn is_emergency_stopped(&self) -> MilvaionResult<bool> {
        self.guarded(|| async {
            let mut conn = self.conn().await?;
            let flag: Option<String> = conn
                .get(self.keys.emergency_stop())
                .await
                .map_err(|e| MilvaionError::Kv(e.to_string()))?;
            Ok(flag.is_some())
        })
        .await
    }

    /// `getRunningJobIds(candidateIds)` — batched membership query over the
    /// running markers.
    pub async fn get_running_job_ids(&self, candidate_ids: &[JobId]) -> MilvaionResult<Vec<JobId>> {
        if candidate_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.guarded(|| async {
            let mut conn = self.conn().await?;
            let keys: Vec<String> = candidate_ids.iter().map(|id| self.keys.running(*id)).collect();
            let exists: Vec<bool> = {
                let mut pipe = redis::pipe();
                for key in &keys {
                    pipe.exists(key);
                }
                pipe.query_async(&mut conn)
                    .await
                    .map_err(|e| MilvaionError::Kv(e.to_string()))?
            };
            Ok(candidate_ids
                .iter()
                .zip(exists)
                .filter_map(|(id, present)| present.then_some(*id))
                .collect())
        })
        .await
    }
}

fn parse_job_ids(raw: Vec<String>) -> Vec<JobId> {
    raw.into_iter()
        .filter_map(|s| match JobId::parse(&s) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(raw = %s, error = %e, "dropping unparsable job id from scheduled set");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> ScheduledJob {
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
            auto_disable_settings: milvaion_core::AutoDisableSettings::default(),
        }
    }

    #[test]
    fn cached_job_projection_omits_execute_at() {
        let job = sample_job();
        let cached = CachedJob::from(&job);
        let json = serde_json::to_string(&cached).unwrap();
        assert!(!json.contains("execute_at"));
        assert_eq!(cached.job_name_in_worker, "sendemail");
    }

    #[test]
    fn parse_job_ids_skips_garbage_entries() {
        let valid = JobId::new();
        let raw = vec![valid.to_string(), "not-a-uuid".to_string()];
        let parsed = parse_job_ids(raw);
        assert_eq!(parsed, vec![valid]);
    }
}
