//! Failed-occurrence handler (C9, §4.9): consumes the dead-letter queue,
//! classifies why the occurrence ended up there, and writes the durable
//! `FailedOccurrence` record. Grounded in the source's single-message
//! consume loop (no batching — prefetch 1, one DLQ message at a time),
//! since the DLQ is the low-volume tail of the system and correctness of
//! the dead-letter record matters more than throughput here.

use crate::bus::{self, DispatchEnvelope};
use crate::metrics::FailedOccurrenceMetrics;
use futures::StreamExt;
use lapin::Channel;
use milvaion_core::{truncate_exception, FailedOccurrence, FailureType, JobOccurrence, OccurrenceStatus, EXCEPTION_TRUNCATION_BYTES};
use milvaion_store::Store;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_EXCEPTION_MESSAGE: &str = "no exception recorded — routing, crash, TTL, or capacity issue";

pub struct FailedOccurrenceHandler {
    store: Arc<dyn Store>,
    channel: Channel,
    queue_name: String,
}

impl FailedOccurrenceHandler {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, channel: Channel, queue_name: String) -> Self {
        Self { store, channel, queue_name }
    }

    pub async fn run(self, cancellation: CancellationToken) {
        let mut consumer = match bus::declare_and_consume(&self.channel, &self.queue_name, "failed-occurrence-handler", 1).await {
            Ok(consumer) => consumer,
            Err(e) => {
                error!(error = %e, "failed-occurrence handler failed to start consuming, exiting task");
                return;
            }
        };

        loop {
            tokio::select! {
                () = cancellation.cancelled() => {
                    info!("failed-occurrence handler shutting down");
                    break;
                }
                delivery = consumer.next() => {
                    let Some(delivery) = delivery else {
                        warn!("failed-occurrences consumer stream ended, exiting task");
                        break;
                    };
                    let Ok(delivery) = delivery else {
                        warn!("failed-occurrences delivery error, skipping");
                        continue;
                    };

                    match self.process(&delivery.data, delivery.properties.headers().as_ref()).await {
                        Ok(()) => bus::ack(&delivery).await,
                        Err(e) => {
                            warn!(error = %e, "failed-occurrence handler processing error, requeuing");
                            bus::nack(&delivery, true).await;
                        }
                    }
                }
            }
        }
    }

    /// Steps 1-5 of §4.9. Returns `Err` only for transient failures (store
    /// unreachable) the caller should requeue for; a malformed envelope or
    /// an occurrence that no longer exists is handled in place (logged,
    /// dropped, acked) since redelivering either would just repeat.
    async fn process(&self, body: &[u8], headers: Option<&lapin::types::FieldTable>) -> milvaion_core::MilvaionResult<()> {
        let headers = bus::read_dispatch_headers(headers);
        let Some(correlation_id) = headers.correlation_id else {
            warn!("dead-lettered message carries no correlation id, dropping");
            return Ok(());
        };

        let envelope: DispatchEnvelope = match serde_json::from_slice(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%correlation_id, error = %e, "unparsable dead-lettered envelope, dropping");
                return Ok(());
            }
        };

        let Some(occurrence) = self.store.get_occurrence(correlation_id).await? else {
            info!(%correlation_id, "dead-lettered occurrence no longer exists, dropping");
            return Ok(());
        };

        let exception = match &occurrence.exception {
            Some(text) if !text.trim().is_empty() => truncate_exception(text, EXCEPTION_TRUNCATION_BYTES),
            _ => DEFAULT_EXCEPTION_MESSAGE.to_string(),
        };

        let failure_type = classify(&occurrence, headers.retry_count, headers.max_retries, &exception);

        let failed = FailedOccurrence::new(
            envelope.id,
            occurrence.id,
            envelope.display_name,
            envelope.job_name_in_worker,
            occurrence.worker_id.clone(),
            envelope.job_data,
            failure_type,
            Some(exception),
            headers.retry_count,
            occurrence.created_at,
        );

        self.store.insert_failed_occurrence(&failed).await?;
        FailedOccurrenceMetrics::processed(failure_type_label(failure_type));
        Ok(())
    }
}

/// §4.9 step 4's classification rule: an explicit retry-budget exhaustion
/// takes priority over everything else, then the occurrence's own status
/// at the time it was dead-lettered narrows it down, with a `Failed`
/// occurrence whose exception mentions "zombie" attributed to the zombie
/// detector rather than a generic unhandled exception.
fn classify(occurrence: &JobOccurrence, retry_count: u32, max_retries: u32, exception: &str) -> FailureType {
    if retry_count > 0 && retry_count >= max_retries {
        return FailureType::MaxRetriesExceeded;
    }
    match occurrence.status {
        OccurrenceStatus::TimedOut => FailureType::Timeout,
        OccurrenceStatus::Cancelled => FailureType::Cancelled,
        OccurrenceStatus::Unknown => FailureType::WorkerCrash,
        OccurrenceStatus::Failed if exception.to_lowercase().contains("zombie") => FailureType::ZombieDetection,
        _ => FailureType::UnhandledException,
    }
}

fn failure_type_label(failure_type: FailureType) -> &'static str {
    match failure_type {
        FailureType::MaxRetriesExceeded => "max_retries_exceeded",
        FailureType::Timeout => "timeout",
        FailureType::Cancelled => "cancelled",
        FailureType::WorkerCrash => "worker_crash",
        FailureType::ZombieDetection => "zombie_detection",
        FailureType::UnhandledException => "unhandled_exception",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use milvaion_core::JobId;

    fn sample(status: OccurrenceStatus) -> JobOccurrence {
        let mut occ = JobOccurrence::new_queued(JobId::new(), "sendemail".into(), 1);
        occ.status = status;
        occ
    }

    #[test]
    fn retry_budget_exhaustion_wins_over_status() {
        let occurrence = sample(OccurrenceStatus::Cancelled);
        assert_eq!(classify(&occurrence, 5, 5, "whatever"), FailureType::MaxRetriesExceeded);
    }

    #[test]
    fn zero_retry_count_does_not_count_as_exhausted() {
        let occurrence = sample(OccurrenceStatus::Failed);
        assert_eq!(classify(&occurrence, 0, 5, "boom"), FailureType::UnhandledException);
    }

    #[test]
    fn failed_with_zombie_mention_classifies_as_zombie_detection() {
        let occurrence = sample(OccurrenceStatus::Failed);
        assert_eq!(
            classify(&occurrence, 0, 5, "reclaimed by Zombie sweep"),
            FailureType::ZombieDetection
        );
    }

    #[test]
    fn unknown_status_classifies_as_worker_crash() {
        let occurrence = sample(OccurrenceStatus::Unknown);
        assert_eq!(classify(&occurrence, 0, 5, "lost heartbeat"), FailureType::WorkerCrash);
    }
}
