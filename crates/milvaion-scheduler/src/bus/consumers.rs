//! Consumer helpers (C4 read side): manual-ack queue declaration and the
//! header parsing shared by every bus-driven component (C6, C7, C9, C10).
//! Grounded in the source's `queue.rs` consume loop, generalized from a
//! blocking Redis list pop to an AMQP manual-ack consumer since multiple
//! queues (status updates, worker logs, registration, heartbeat, DLQ) all
//! need the same declare/qos/consume/ack shape (§4.4).

use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Consumer};
use milvaion_core::{MilvaionError, MilvaionResult, OccurrenceId};
use tracing::warn;

/// Default `MaxRetries` assumed when a dispatch message predates this
/// header or arrives from a non-conforming producer — mirrors the
/// dispatcher's own `maxRetryAttempts` default (§6).
const DEFAULT_MAX_RETRIES: u32 = 5;

/// Headers carried on a dispatch/DLQ message (§6): `CorrelationId` and
/// `MaxRetries` on every dispatch, `x-retry-count` added on DLQ
/// redelivery.
#[derive(Debug, Clone)]
pub struct DispatchHeaders {
    pub correlation_id: Option<OccurrenceId>,
    pub max_retries: u32,
    pub retry_count: u32,
}

fn header_value<'a>(headers: &'a FieldTable, key: &str) -> Option<&'a AMQPValue> {
    headers.inner().iter().find(|(name, _)| name.as_str() == key).map(|(_, value)| value)
}

fn amqp_value_as_str(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(s.to_string()),
        AMQPValue::ShortString(s) => Some(s.to_string()),
        _ => None,
    }
}

fn amqp_value_as_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        _ => None,
    }
}

/// Parses `CorrelationId`/`MaxRetries`/`x-retry-count` out of a delivery's
/// AMQP headers. Missing `max_retries` falls back to the dispatcher's own
/// default; missing `retry_count` means first delivery (zero).
#[must_use]
pub fn read_dispatch_headers(headers: Option<&FieldTable>) -> DispatchHeaders {
    let correlation_id = headers
        .and_then(|h| header_value(h, "CorrelationId"))
        .and_then(amqp_value_as_str)
        .and_then(|s| OccurrenceId::parse(&s).ok());

    let max_retries = headers
        .and_then(|h| header_value(h, "MaxRetries"))
        .and_then(amqp_value_as_i64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(DEFAULT_MAX_RETRIES);

    let retry_count = headers
        .and_then(|h| header_value(h, "x-retry-count"))
        .and_then(amqp_value_as_i64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0);

    DispatchHeaders { correlation_id, max_retries, retry_count }
}

/// Declares `queue_name` durable, sets the channel's prefetch bound, and
/// returns a manual-ack consumer. Shared by every queue consumer — only
/// the queue name, consumer tag, and prefetch differ per caller.
pub async fn declare_and_consume(channel: &Channel, queue_name: &str, consumer_tag: &str, prefetch: u16) -> MilvaionResult<Consumer> {
    channel
        .basic_qos(prefetch, BasicQosOptions::default())
        .await
        .map_err(|e| MilvaionError::Bus(format!("failed to set prefetch on {queue_name}: {e}")))?;

    channel
        .queue_declare(queue_name, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
        .await
        .map_err(|e| MilvaionError::Bus(format!("failed to declare queue {queue_name}: {e}")))?;

    channel
        .basic_consume(queue_name, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
        .await
        .map_err(|e| MilvaionError::Bus(format!("failed to consume {queue_name}: {e}")))
}

/// Acks a delivery. A failed ack only matters if the connection already
/// dropped, which the consumer loop observes separately, so this logs
/// rather than propagates.
pub async fn ack(delivery: &Delivery) {
    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
        warn!(error = %e, "failed to ack delivery");
    }
}

/// Rejects a delivery. `requeue=false` is the normal case — malformed or
/// unprocessable messages are dropped or dead-lettered by the broker's
/// own policy, never spun in place; `requeue=true` is reserved for
/// transient failures (store unreachable) where redelivery is wanted.
pub async fn nack(delivery: &Delivery, requeue: bool) {
    if let Err(e) = delivery.nack(BasicNackOptions { requeue, ..Default::default() }).await {
        warn!(error = %e, "failed to nack delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::{LongString, ShortString};

    fn headers_with(correlation_id: &str, max_retries: i64, retry_count: Option<i64>) -> FieldTable {
        let mut table = FieldTable::default();
        table.insert(ShortString::from("CorrelationId"), AMQPValue::LongString(LongString::from(correlation_id.to_string())));
        table.insert(ShortString::from("MaxRetries"), AMQPValue::LongLongInt(max_retries));
        if let Some(retry_count) = retry_count {
            table.insert(ShortString::from("x-retry-count"), AMQPValue::LongLongInt(retry_count));
        }
        table
    }

    #[test]
    fn parses_all_headers_when_present() {
        let occurrence_id = OccurrenceId::new();
        let table = headers_with(&occurrence_id.to_string(), 5, Some(2));
        let parsed = read_dispatch_headers(Some(&table));
        assert_eq!(parsed.correlation_id, Some(occurrence_id));
        assert_eq!(parsed.max_retries, 5);
        assert_eq!(parsed.retry_count, 2);
    }

    #[test]
    fn missing_retry_count_defaults_to_zero() {
        let occurrence_id = OccurrenceId::new();
        let table = headers_with(&occurrence_id.to_string(), 5, None);
        let parsed = read_dispatch_headers(Some(&table));
        assert_eq!(parsed.retry_count, 0);
    }

    #[test]
    fn absent_headers_use_defaults() {
        let parsed = read_dispatch_headers(None);
        assert_eq!(parsed.correlation_id, None);
        assert_eq!(parsed.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(parsed.retry_count, 0);
    }
}
