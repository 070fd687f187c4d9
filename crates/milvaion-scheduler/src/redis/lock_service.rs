//! Redis lock service (C2): fenced per-job locks used by the dispatcher
//! to prevent double-publish across concurrent instances. Grounded in the
//! source's leader-election lock (`SET NX EX` acquire, Lua check-and-delete
//! release) but retargeted from one lock per scheduler process to one lock
//! per job per dispatch attempt — see DESIGN.md for the rationale.

use deadpool_redis::Pool;
use milvaion_core::{JobId, MilvaionError, MilvaionResult};
use redis::AsyncCommands;
use std::time::Duration;

use super::RedisKeys;

/// Lua script for fenced release: deletes the lock only if the stored
/// value still matches the caller's owner id. A naive GET-then-DEL is
/// unsafe — the lock could expire and be re-acquired by someone else
/// between the two calls — so this must be a single atomic script.
const RELEASE_SCRIPT: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
";

pub struct LockService {
    pool: Pool,
    keys: RedisKeys,
}

impl LockService {
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

    /// `tryAcquireLock(jobId, owner, ttl)` — single atomic `SET NX EX`, no
    /// read-then-write.
    pub async fn try_acquire_lock(&self, job_id: JobId, owner: &str, ttl: Duration) -> MilvaionResult<bool> {
        let mut conn = self.conn().await?;
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.keys.lock(job_id))
            .arg(owner)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| MilvaionError::Kv(e.to_string()))?;
        Ok(acquired.is_some())
    }

    /// `releaseLock(jobId, owner)` — fenced release; a no-op if the lock
    /// already expired or is held by someone else.
    pub async fn release_lock(&self, job_id: JobId, owner: &str) -> MilvaionResult<()> {
        let mut conn = self.conn().await?;
        let _: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.keys.lock(job_id))
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| MilvaionError::Kv(e.to_string()))?;
        Ok(())
    }

    /// `getLockOwner(jobId)` — diagnostic only; never used for correctness
    /// decisions (the dispatcher relies solely on `try_acquire_lock`'s
    /// return value).
    pub async fn get_lock_owner(&self, job_id: JobId) -> MilvaionResult<Option<String>> {
        let mut conn = self.conn().await?;
        let owner: Option<String> = conn
            .get(self.keys.lock(job_id))
            .await
            .map_err(|e| MilvaionError::Kv(e.to_string()))?;
        Ok(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::RELEASE_SCRIPT;

    #[test]
    fn release_script_checks_owner_before_deleting() {
        assert!(RELEASE_SCRIPT.contains("redis.call('get', KEYS[1])"));
        assert!(RELEASE_SCRIPT.contains("redis.call('del', KEYS[1])"));
    }
}
