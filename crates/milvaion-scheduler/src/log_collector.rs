//! Log collector (C7, §4.7): batches worker-emitted log lines by
//! `correlationId` and appends them to the matching occurrence. Grounded in
//! `status_tracker.rs`'s batching shape (poll-interval/flush-timer/consumer
//! `tokio::select!`), simplified since C7 has no eager path and no state
//! machine to apply — just group, load, append, persist.

use crate::bus::{self, LogEnvelope};
use crate::metrics::LogCollectorMetrics;
use futures::StreamExt;
use lapin::types::LongLongUInt;
use lapin::Channel;
use milvaion_config::LogCollectorConfig;
use milvaion_core::{LogEntry, OccurrenceId};
use milvaion_store::Store;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub struct LogCollector {
    store: Arc<dyn Store>,
    channel: Channel,
    queue_name: String,
    config: LogCollectorConfig,
}

impl LogCollector {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, channel: Channel, queue_name: String, config: LogCollectorConfig) -> Self {
        Self { store, channel, queue_name, config }
    }

    pub async fn run(self, cancellation: CancellationToken) {
        let mut consumer = match bus::declare_and_consume(
            &self.channel,
            &self.queue_name,
            "log-collector",
            self.config.consumer_prefetch,
        )
        .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                error!(error = %e, "log collector failed to start consuming, exiting task");
                return;
            }
        };

        let mut pending: HashMap<OccurrenceId, Vec<LogEntry>> = HashMap::new();
        let mut flush_deadline = Instant::now() + self.config.batch_interval();

        loop {
            let sleep_for = flush_deadline.saturating_duration_since(Instant::now());
            tokio::select! {
                () = cancellation.cancelled() => {
                    self.flush(&mut pending).await;
                    break;
                }
                () = time::sleep(sleep_for) => {
                    self.flush(&mut pending).await;
                    flush_deadline = Instant::now() + self.config.batch_interval();
                }
                delivery = consumer.next() => {
                    let Some(delivery) = delivery else {
                        warn!("worker-logs consumer stream ended, exiting task");
                        break;
                    };
                    let Ok(delivery) = delivery else {
                        warn!("worker-logs delivery error, skipping");
                        continue;
                    };

                    match serde_json::from_slice::<LogEnvelope>(&delivery.data) {
                        Ok(entry) => {
                            LogCollectorMetrics::log_received();
                            pending.entry(entry.correlation_id).or_default().push(entry.log);
                        }
                        Err(e) => {
                            warn!(error = %e, "unparsable log message, dropping");
                        }
                    }
                    ack_tag(&self.channel, delivery.delivery_tag).await;

                    if pending.len() >= self.config.batch_size as usize {
                        self.flush(&mut pending).await;
                        flush_deadline = Instant::now() + self.config.batch_interval();
                    }
                }
            }
        }
    }

    /// A message is acked the moment it is enqueued in `pending`, not after
    /// the flush persists it (§4.7): a crash between enqueue and flush
    /// loses at most one unflushed batch, which the contract accepts.
    async fn flush(&self, pending: &mut HashMap<OccurrenceId, Vec<LogEntry>>) {
        if pending.is_empty() {
            return;
        }
        let started = std::time::Instant::now();
        let batch: HashMap<OccurrenceId, Vec<LogEntry>> = std::mem::take(pending);
        let count = batch.len();

        let ids: Vec<OccurrenceId> = batch.keys().copied().collect();
        let existing = match self.store.get_occurrences_bulk(&ids).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "log collector failed to load occurrences for batch flush, dropping batch");
                return;
            }
        };
        let known: std::collections::HashSet<OccurrenceId> = existing.into_iter().map(|occ| occ.id).collect();

        let mut updates = Vec::with_capacity(batch.len());
        for (correlation_id, logs) in batch {
            if known.contains(&correlation_id) {
                updates.push((correlation_id, logs));
            } else {
                debug!(%correlation_id, "log batch for unknown occurrence, dropping");
            }
        }

        if !updates.is_empty() {
            if let Err(e) = self.store.append_logs_bulk(&updates).await {
                error!(error = %e, count = updates.len(), "failed to persist log batch");
            }
        }

        LogCollectorMetrics::batch_flushed(count, started.elapsed().as_secs_f64());
    }
}

async fn ack_tag(channel: &Channel, tag: LongLongUInt) {
    use lapin::options::BasicAckOptions;
    if let Err(e) = channel.basic_ack(tag, BasicAckOptions::default()).await {
        warn!(error = %e, "failed to ack worker-log delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use milvaion_core::{JobId, LogLevel};

    fn sample_log() -> LogEntry {
        LogEntry {
            timestamp: chrono::Utc::now(),
            level: LogLevel::Information,
            message: "working".into(),
            category: "worker".into(),
            data: None,
        }
    }

    #[test]
    fn envelopes_group_by_correlation_id() {
        let a = OccurrenceId::new();
        let b = OccurrenceId::new();
        let mut pending: HashMap<OccurrenceId, Vec<LogEntry>> = HashMap::new();
        pending.entry(a).or_default().push(sample_log());
        pending.entry(a).or_default().push(sample_log());
        pending.entry(b).or_default().push(sample_log());
        assert_eq!(pending.get(&a).unwrap().len(), 2);
        assert_eq!(pending.get(&b).unwrap().len(), 1);
    }

    #[test]
    fn unrelated_job_id_does_not_collide_with_occurrence_id() {
        let job_id = JobId::new();
        let occurrence_id = OccurrenceId::new();
        assert_ne!(job_id.to_string(), occurrence_id.to_string());
    }
}
