//! Status tracker (C6, §4.6): consumes worker status updates, applies the
//! occurrence state machine, and drives per-job auto-disable. Splits work
//! into an eager path (the Redis running marker is cleared or set inline,
//! fire-and-forget, the moment a message arrives) and a batched path (the
//! relational store is only written every `batch_size` messages or
//! `batch_interval`, whichever comes first) — grounded in the source's
//! `worker.rs` consume loop, generalized from one-shot per-message
//! processing to this two-speed batch/eager split since the spec
//! explicitly separates "update the KV marker now" from "persist soon".

use crate::bus::{self, StatusUpdateEnvelope};
use crate::metrics::StatusTrackerMetrics;
use crate::redis::{SchedulerClient, WorkerRegistry};
use chrono::Utc;
use futures::StreamExt;
use lapin::Channel;
use milvaion_config::{AutoDisableConfig, StatusTrackerConfig};
use milvaion_core::{
    truncate_exception, JobId, JobOccurrence, OccurrenceId, OccurrenceStatus, EXCEPTION_TRUNCATION_BYTES,
};
use milvaion_store::Store;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub struct StatusTracker {
    store: Arc<dyn Store>,
    scheduler_client: Arc<SchedulerClient>,
    worker_registry: Arc<WorkerRegistry>,
    channel: Channel,
    queue_name: String,
    config: StatusTrackerConfig,
    auto_disable: AutoDisableConfig,
}

impl StatusTracker {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        scheduler_client: Arc<SchedulerClient>,
        worker_registry: Arc<WorkerRegistry>,
        channel: Channel,
        queue_name: String,
        config: StatusTrackerConfig,
        auto_disable: AutoDisableConfig,
    ) -> Self {
        Self { store, scheduler_client, worker_registry, channel, queue_name, config, auto_disable }
    }

    pub async fn run(self, cancellation: CancellationToken) {
        let mut consumer = match bus::declare_and_consume(
            &self.channel,
            &self.queue_name,
            "status-tracker",
            self.config.consumer_prefetch,
        )
        .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                error!(error = %e, "status tracker failed to start consuming, exiting task");
                return;
            }
        };

        let mut pending: HashMap<OccurrenceId, PendingUpdate> = HashMap::new();
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
                        warn!("status-updates consumer stream ended, exiting task");
                        break;
                    };
                    let Ok(delivery) = delivery else {
                        warn!("status-updates delivery error, skipping");
                        continue;
                    };

                    match serde_json::from_slice::<StatusUpdateEnvelope>(&delivery.data) {
                        Ok(update) => {
                            StatusTrackerMetrics::message_received(status_label(update.status));
                            self.apply_eager(&update).await;
                            pending
                                .entry(update.correlation_id)
                                .or_insert_with(|| PendingUpdate { delivery_tags: Vec::new(), update: None })
                                .merge(delivery.delivery_tag, update);
                        }
                        Err(e) => {
                            warn!(error = %e, "unparsable status update message, dropping");
                            bus::nack(&delivery, false).await;
                            continue;
                        }
                    }

                    if pending.len() >= self.config.batch_size as usize {
                        self.flush(&mut pending).await;
                        flush_deadline = Instant::now() + self.config.batch_interval();
                    }
                }
            }
        }
    }

    /// Clears or sets the Redis running marker and the worker's
    /// consumer-job counter immediately, independent of the batch flush
    /// (§4.6: the marker must not wait on the batch interval or a stuck
    /// job would look "free" to dispatch for up to a full batch window).
    async fn apply_eager(&self, update: &StatusUpdateEnvelope) {
        if update.status == OccurrenceStatus::Running {
            if let Err(e) = self
                .scheduler_client
                .try_mark_job_as_running(update.job_id, update.correlation_id, StdDuration::from_secs(300))
                .await
            {
                debug!(job_id = %update.job_id, error = %e, "eager running-marker set failed, batch flush will reconcile");
            }
            return;
        }

        if update.status.is_final() {
            if let Err(e) = self.scheduler_client.mark_job_as_completed(update.job_id).await {
                debug!(job_id = %update.job_id, error = %e, "eager running-marker clear failed");
            }
        }
    }

    async fn flush(&self, pending: &mut HashMap<OccurrenceId, PendingUpdate>) {
        if pending.is_empty() {
            return;
        }
        let started = std::time::Instant::now();
        let batch: HashMap<OccurrenceId, PendingUpdate> = std::mem::take(pending);
        let ids: Vec<OccurrenceId> = batch.keys().copied().collect();

        let existing = match self.store.get_occurrences_bulk(&ids).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "status tracker failed to load occurrences for batch flush, requeuing batch");
                for item in batch.into_values() {
                    for tag in item.delivery_tags {
                        nack_tag(&self.channel, tag, true).await;
                    }
                }
                return;
            }
        };
        let mut by_id: HashMap<OccurrenceId, JobOccurrence> = existing.into_iter().map(|occ| (occ.id, occ)).collect();

        let mut to_persist = Vec::new();
        let mut newly_failed: Vec<JobId> = Vec::new();
        let mut newly_completed: Vec<JobId> = Vec::new();
        let mut acked_tags = Vec::new();
        let mut requeue_tags = Vec::new();
        // (worker_id, job_name, entering_running) — applied to the Redis
        // consumer counters after the batch persists (§4.6 step 3:
        // "increment on enter-Running, decrement on leave-Running").
        let mut consumer_deltas: Vec<(String, String, bool)> = Vec::new();

        for (correlation_id, item) in batch {
            let Some(occurrence) = by_id.remove(&correlation_id) else {
                warn!(%correlation_id, "status update for unknown occurrence, dropping");
                acked_tags.extend(item.delivery_tags);
                continue;
            };
            let Some(update) = item.update else {
                acked_tags.extend(item.delivery_tags);
                continue;
            };

            let mut occurrence = occurrence;
            let job_id = occurrence.job_id;
            let from = occurrence.status;
            match apply_update(&mut occurrence, update) {
                Applied::Heartbeat | Applied::Transitioned => {
                    if occurrence.status == OccurrenceStatus::Failed {
                        newly_failed.push(job_id);
                    } else if occurrence.status == OccurrenceStatus::Completed {
                        newly_completed.push(job_id);
                    }
                    if let Some(worker_id) = occurrence.worker_id.clone() {
                        if from != OccurrenceStatus::Running && occurrence.status == OccurrenceStatus::Running {
                            consumer_deltas.push((worker_id, occurrence.job_name.clone(), true));
                        } else if from == OccurrenceStatus::Running && occurrence.status.is_final() {
                            consumer_deltas.push((worker_id, occurrence.job_name.clone(), false));
                        }
                    }
                    to_persist.push(occurrence);
                    acked_tags.extend(item.delivery_tags);
                }
                Applied::IllegalTransition => {
                    warn!(%correlation_id, "ignoring illegal status transition");
                    acked_tags.extend(item.delivery_tags);
                }
            }
        }

        let mut persisted = true;
        if !to_persist.is_empty() {
            if let Err(e) = self.store.update_occurrences_bulk(&to_persist).await {
                error!(error = %e, count = to_persist.len(), "failed to persist status update batch");
                requeue_tags.extend(acked_tags.drain(..));
                persisted = false;
            }
        }

        for tag in acked_tags {
            nack_tag(&self.channel, tag, false).await;
        }
        for tag in requeue_tags {
            nack_tag(&self.channel, tag, true).await;
        }

        if persisted {
            for (worker_id, job_name, entering_running) in consumer_deltas {
                let result = if entering_running {
                    self.worker_registry.increment_consumer_job_count(&worker_id, &job_name).await
                } else {
                    self.worker_registry.decrement_consumer_job_count(&worker_id, &job_name).await
                };
                if let Err(e) = result {
                    warn!(worker_id, job_name, error = %e, "failed to update consumer job counter");
                }
            }
        }

        for job_id in newly_failed {
            self.record_failure_and_maybe_disable(job_id, Utc::now()).await;
        }
        for job_id in newly_completed {
            if let Err(e) = self.store.record_job_success(job_id).await {
                warn!(job_id = %job_id, error = %e, "failed to record job success");
            }
        }

        StatusTrackerMetrics::batch_flushed(ids.len(), started.elapsed().as_secs_f64());
    }

    async fn record_failure_and_maybe_disable(&self, job_id: JobId, failed_at: chrono::DateTime<Utc>) {
        if let Err(e) = self
            .store
            .record_job_failure(job_id, failed_at, self.auto_disable.failure_window())
            .await
        {
            warn!(job_id = %job_id, error = %e, "failed to record job failure");
            return;
        }

        match self.store.get_active_job(job_id).await {
            Ok(Some(job)) if job.auto_disable_settings.enabled => {
                let threshold = job
                    .auto_disable_settings
                    .threshold
                    .unwrap_or(self.auto_disable.consecutive_failure_threshold);
                if job.auto_disable_settings.consecutive_failure_count >= threshold {
                    let reason = format!(
                        "auto-disabled after {} consecutive failures",
                        job.auto_disable_settings.consecutive_failure_count
                    );
                    match self.store.auto_disable_job(job_id, reason).await {
                        Ok(()) => {
                            StatusTrackerMetrics::job_auto_disabled();
                            // §4.6: disabling a job also pulls it out of the
                            // dispatcher's time index and cache so it stops
                            // coming up due, instead of just sitting inactive.
                            if let Err(e) = self.scheduler_client.remove_from_scheduled_set(job_id).await {
                                warn!(job_id = %job_id, error = %e, "failed to remove auto-disabled job from time index");
                            }
                            if let Err(e) = self.scheduler_client.remove_cached_job(job_id).await {
                                warn!(job_id = %job_id, error = %e, "failed to evict auto-disabled job from cache");
                            }
                        }
                        Err(e) => warn!(job_id = %job_id, error = %e, "failed to auto-disable job"),
                    }
                }
            }
            Ok(_) => {}
            Err(e) => warn!(job_id = %job_id, error = %e, "failed to load job for auto-disable check"),
        }
    }
}

struct PendingUpdate {
    delivery_tags: Vec<lapin::types::LongLongUInt>,
    update: Option<StatusUpdateEnvelope>,
}

impl PendingUpdate {
    /// Later messages win on every field the envelope carries; the
    /// delivery tag list accumulates so every message in the merge gets
    /// ack'd once the merged result is persisted.
    fn merge(&mut self, tag: lapin::types::LongLongUInt, update: StatusUpdateEnvelope) {
        self.delivery_tags.push(tag);
        self.update = Some(update);
    }
}

enum Applied {
    Heartbeat,
    Transitioned,
    IllegalTransition,
}

/// Applies one merged status update to the occurrence it targets,
/// returning whether it was a no-op heartbeat, a real transition, or
/// rejected as illegal per the state machine (§4.6).
fn apply_update(occurrence: &mut JobOccurrence, update: StatusUpdateEnvelope) -> Applied {
    if update.is_heartbeat_only() {
        occurrence.last_heartbeat = Some(Utc::now());
        return Applied::Heartbeat;
    }

    if !occurrence.status.can_transition_to(update.status) {
        return Applied::IllegalTransition;
    }

    let from = occurrence.status;
    occurrence.status = update.status;
    occurrence.record_transition(from, update.status);

    if let Some(worker_id) = update.worker_id {
        occurrence.worker_id = Some(worker_id);
    }
    if let Some(start_time) = update.start_time {
        occurrence.start_time = Some(start_time);
        occurrence.last_heartbeat = Some(start_time);
    }
    if let Some(end_time) = update.end_time {
        occurrence.end_time = Some(end_time);
    }
    if let Some(duration_ms) = update.duration_ms {
        occurrence.duration_ms = Some(duration_ms);
    }
    if let Some(result) = update.result {
        occurrence.result = Some(result);
    }
    match update.exception {
        Some(exception) if !exception.is_empty() => {
            occurrence.exception = Some(truncate_exception(&exception, EXCEPTION_TRUNCATION_BYTES));
        }
        // §4.6 exception policy: a late Completed update with an empty (or
        // absent) exception clears whatever exception a prior Running
        // heartbeat or retry may have recorded.
        _ if update.status == OccurrenceStatus::Completed => {
            occurrence.exception = None;
        }
        _ => {}
    }

    Applied::Transitioned
}

fn status_label(status: OccurrenceStatus) -> &'static str {
    match status {
        OccurrenceStatus::Queued => "queued",
        OccurrenceStatus::Running => "running",
        OccurrenceStatus::Completed => "completed",
        OccurrenceStatus::Failed => "failed",
        OccurrenceStatus::Cancelled => "cancelled",
        OccurrenceStatus::TimedOut => "timed_out",
        OccurrenceStatus::Unknown => "unknown",
    }
}

async fn nack_tag(channel: &Channel, tag: lapin::types::LongLongUInt, requeue: bool) {
    use lapin::options::BasicNackOptions;
    if let Err(e) = channel
        .basic_nack(tag, BasicNackOptions { requeue, ..Default::default() })
        .await
    {
        warn!(error = %e, "failed to ack/nack batched status update delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use milvaion_core::JobId;

    fn sample_occurrence() -> JobOccurrence {
        JobOccurrence::new_queued(JobId::new(), "sendemail".into(), 1)
    }

    fn running_update(correlation_id: OccurrenceId, job_id: JobId) -> StatusUpdateEnvelope {
        StatusUpdateEnvelope {
            correlation_id,
            job_id,
            worker_id: Some("email-workers-1".into()),
            status: OccurrenceStatus::Running,
            start_time: Some(Utc::now()),
            end_time: None,
            duration_ms: None,
            result: None,
            exception: None,
        }
    }

    #[test]
    fn heartbeat_update_does_not_change_status() {
        let mut occurrence = sample_occurrence();
        occurrence.status = OccurrenceStatus::Running;
        let heartbeat = StatusUpdateEnvelope {
            correlation_id: occurrence.id,
            job_id: occurrence.job_id,
            worker_id: None,
            status: OccurrenceStatus::Running,
            start_time: None,
            end_time: None,
            duration_ms: None,
            result: None,
            exception: None,
        };
        let outcome = apply_update(&mut occurrence, heartbeat);
        assert!(matches!(outcome, Applied::Heartbeat));
        assert_eq!(occurrence.status, OccurrenceStatus::Running);
    }

    #[test]
    fn queued_to_running_transition_is_applied() {
        let mut occurrence = sample_occurrence();
        let update = running_update(occurrence.id, occurrence.job_id);
        let outcome = apply_update(&mut occurrence, update);
        assert!(matches!(outcome, Applied::Transitioned));
        assert_eq!(occurrence.status, OccurrenceStatus::Running);
        assert_eq!(occurrence.status_change_logs.len(), 1);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut occurrence = sample_occurrence();
        occurrence.status = OccurrenceStatus::Completed;
        let update = StatusUpdateEnvelope {
            correlation_id: occurrence.id,
            job_id: occurrence.job_id,
            worker_id: None,
            status: OccurrenceStatus::Failed,
            start_time: None,
            end_time: None,
            duration_ms: None,
            result: None,
            exception: None,
        };
        let outcome = apply_update(&mut occurrence, update);
        assert!(matches!(outcome, Applied::IllegalTransition));
        assert_eq!(occurrence.status, OccurrenceStatus::Completed);
    }

    #[test]
    fn oversized_exception_is_truncated_on_apply() {
        let mut occurrence = sample_occurrence();
        occurrence.status = OccurrenceStatus::Running;
        let huge = "e".repeat(EXCEPTION_TRUNCATION_BYTES + 200);
        let update = StatusUpdateEnvelope {
            correlation_id: occurrence.id,
            job_id: occurrence.job_id,
            worker_id: None,
            status: OccurrenceStatus::Failed,
            start_time: None,
            end_time: Some(Utc::now()),
            duration_ms: Some(10),
            result: None,
            exception: Some(huge),
        };
        apply_update(&mut occurrence, update);
        assert!(occurrence.exception.unwrap().contains("truncated"));
    }

    #[test]
    fn late_completed_with_no_exception_clears_prior_exception() {
        let mut occurrence = sample_occurrence();
        occurrence.status = OccurrenceStatus::Running;
        occurrence.exception = Some("a transient retry warning".into());
        let update = StatusUpdateEnvelope {
            correlation_id: occurrence.id,
            job_id: occurrence.job_id,
            worker_id: None,
            status: OccurrenceStatus::Completed,
            start_time: None,
            end_time: Some(Utc::now()),
            duration_ms: Some(10),
            result: Some("ok".into()),
            exception: None,
        };
        apply_update(&mut occurrence, update);
        assert_eq!(occurrence.exception, None);
    }
}
