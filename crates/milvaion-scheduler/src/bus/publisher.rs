//! Bus publisher (C4 write side): dispatch messages on the `jobs` topic
//! exchange with header propagation, plus best-effort observer events.
//! Grounded in the source's `redis/queue.rs` enqueue path, generalized
//! from a Redis sorted-set push to an AMQP topic-exchange publish with
//! persistent delivery and headers — the wire format spec §6 requires
//! that a Redis list cannot express (per-message headers, topic routing).

use deadpool_lapin::Pool;
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, ExchangeKind};
use milvaion_config::BusConfig;
use milvaion_core::{MilvaionError, MilvaionResult, OccurrenceId};
use serde::Serialize;
use tracing::{debug, warn};

use super::envelopes::DispatchEnvelope;

/// Fanout exchange for "occurrences created"/"occurrences updated"
/// stream-out events (§4.5 step 8, §4.8). Not named in §6's KV/queue
/// layout since these are observer notifications, not part of the
/// durable contract — any subscriber that cares binds its own queue.
const EVENTS_EXCHANGE: &str = "milvaion.events";

pub struct BusPublisher {
    pool: Pool,
    config: BusConfig,
}

impl BusPublisher {
    #[must_use]
    pub fn new(pool: Pool, config: BusConfig) -> Self {
        Self { pool, config }
    }

    async fn channel(&self) -> MilvaionResult<Channel> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| MilvaionError::Bus(format!("failed to acquire amqp connection: {e}")))?;
        conn.create_channel()
            .await
            .map_err(|e| MilvaionError::Bus(format!("failed to create amqp channel: {e}")))
    }

    /// Declares the `jobs` topic exchange and the events fanout exchange,
    /// both durable. Idempotent; called at start-up and safe to repeat on
    /// reconnect.
    pub async fn declare_topology(&self) -> MilvaionResult<()> {
        let channel = self.channel().await?;
        channel
            .exchange_declare(
                &self.config.jobs_exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MilvaionError::Bus(format!("failed to declare jobs exchange: {e}")))?;
        channel
            .exchange_declare(
                EVENTS_EXCHANGE,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MilvaionError::Bus(format!("failed to declare events exchange: {e}")))?;
        Ok(())
    }

    /// Publishes a dispatch message (§4.5 step 9, §6): routing key
    /// `{jobNameInWorker}.{occurrenceId}`, headers `CorrelationId` and
    /// `MaxRetries`, persistent delivery (`delivery_mode = 2`).
    pub async fn publish_dispatch(
        &self,
        routing_key: &str,
        envelope: &DispatchEnvelope,
        correlation_id: OccurrenceId,
        max_retries: u32,
    ) -> MilvaionResult<()> {
        let channel = self.channel().await?;
        let body = serde_json::to_vec(envelope)?;

        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from("CorrelationId"),
            AMQPValue::LongString(LongString::from(correlation_id.to_string())),
        );
        headers.insert(ShortString::from("MaxRetries"), AMQPValue::LongLongInt(i64::from(max_retries)));

        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type(ShortString::from("application/json"))
            .with_headers(headers);

        channel
            .basic_publish(&self.config.jobs_exchange, routing_key, BasicPublishOptions::default(), &body, properties)
            .await
            .map_err(|e| MilvaionError::PublishFailed(e.to_string()))?
            .await
            .map_err(|e| MilvaionError::PublishFailed(e.to_string()))?;

        debug!(routing_key, %correlation_id, "published dispatch message");
        Ok(())
    }

    /// Passively inspects the depth of the queue a worker group binds for
    /// `job_name_in_worker` (§4.5 step 6: "if not running and policy=Skip,
    /// inspect the depth of the job's routing queue on the bus"). By
    /// convention each worker group declares one durable queue named after
    /// the job type it consumes, bound to the jobs exchange with pattern
    /// `{jobNameInWorker}.*`. A queue no worker has declared yet reads as
    /// empty rather than an error — there is nothing backed up if nobody
    /// is listening.
    pub async fn queue_depth(&self, job_name_in_worker: &str) -> MilvaionResult<u32> {
        let channel = self.channel().await?;
        let declared = channel
            .queue_declare(job_name_in_worker, QueueDeclareOptions { passive: true, ..Default::default() }, FieldTable::default())
            .await;
        match declared {
            Ok(queue) => Ok(queue.message_count()),
            Err(_) => Ok(0),
        }
    }

    /// Publishes a best-effort JSON event to the observer fanout exchange
    /// (§4.5 step 8 "occurrences created", §4.8 "occurrences updated").
    /// Failures are logged, never propagated: these are stream-out
    /// notifications, not part of the durable record.
    pub async fn publish_event(&self, event_type: &str, payload: &impl Serialize) {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, event_type, "failed to serialize observer event");
                return;
            }
        };
        let channel = match self.channel().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, event_type, "failed to acquire channel for observer event");
                return;
            }
        };
        if let Err(e) = channel
            .basic_publish(EVENTS_EXCHANGE, event_type, BasicPublishOptions::default(), &body, BasicProperties::default())
            .await
        {
            warn!(error = %e, event_type, "failed to publish observer event");
        }
    }
}
