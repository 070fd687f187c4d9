//! Message bus adapters (C4, §4.4): connection pooling plus the publish
//! and consume helpers every bus-driven component builds on. Grounded in
//! the source's `worker.rs`/`scheduler.rs` connection-recovery shape,
//! retargeted from Redis to AMQP since the spec's message bus is a
//! separate system from the KV store (§2).

mod consumers;
mod envelopes;
mod publisher;

pub use consumers::{ack, declare_and_consume, nack, read_dispatch_headers, DispatchHeaders};
pub use envelopes::{DispatchEnvelope, HeartbeatEnvelope, JobConfigEnvelope, LogEnvelope, RegistrationEnvelope, StatusUpdateEnvelope};
pub use publisher::BusPublisher;

use deadpool_lapin::{Config as PoolConfig, Pool, Runtime};
use milvaion_core::{MilvaionError, MilvaionResult};

/// Builds the AMQP connection pool and verifies connectivity with one
/// throwaway channel — mirrors `DatabasePool::connect`'s eager
/// reachability check (milvaion-store).
pub async fn create_pool(url: &str) -> MilvaionResult<Pool> {
    let config = PoolConfig { url: Some(url.to_string()), ..PoolConfig::default() };
    let pool = config
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| MilvaionError::Bus(format!("failed to build amqp pool: {e}")))?;

    let conn = pool.get().await.map_err(|e| MilvaionError::Bus(format!("failed to connect to amqp broker: {e}")))?;
    conn.create_channel()
        .await
        .map_err(|e| MilvaionError::Bus(format!("amqp broker reachable but channel open failed: {e}")))?;

    Ok(pool)
}
