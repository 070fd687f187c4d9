//! Zombie detector (C8, §4.8): a periodic sweep that reclaims occurrences
//! stuck in `Queued` past their zombie timeout (never picked up by a
//! worker) and occurrences stuck in `Running` with a stale or missing
//! heartbeat (the worker that owned them is presumed gone). Grounded in
//! the source's periodic-sweep tasks (`cron.rs`-style interval loop),
//! generalized to the two-sweep/one-bulk-update shape this spec requires.

use crate::metrics::ZombieDetectorMetrics;
use crate::redis::SchedulerClient;
use chrono::Utc;
use milvaion_config::ZombieDetectorConfig;
use milvaion_core::{JobOccurrence, OccurrenceStatus};
use milvaion_store::Store;
use std::sync::Arc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::BusPublisher;

pub struct ZombieDetector {
    store: Arc<dyn Store>,
    scheduler_client: Arc<SchedulerClient>,
    publisher: Arc<BusPublisher>,
    config: ZombieDetectorConfig,
}

impl ZombieDetector {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        scheduler_client: Arc<SchedulerClient>,
        publisher: Arc<BusPublisher>,
        config: ZombieDetectorConfig,
    ) -> Self {
        Self { store, scheduler_client, publisher, config }
    }

    pub async fn run(self, cancellation: CancellationToken) {
        let mut tick = time::interval(self.config.check_interval());
        loop {
            tokio::select! {
                () = cancellation.cancelled() => {
                    info!("zombie detector shutting down");
                    break;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "zombie sweep failed");
                    }
                }
            }
        }
    }

    async fn sweep(&self) -> milvaion_core::MilvaionResult<()> {
        let now = Utc::now();
        let default_timeout = self.config.zombie_timeout_minutes;

        let mut stale_queued = self.store.find_stale_queued(now, default_timeout).await?;
        for occurrence in &mut stale_queued {
            reclaim(occurrence, now, "never consumed".to_string());
        }

        let mut lost_running = self.store.find_lost_running(now, default_timeout).await?;
        for occurrence in &mut lost_running {
            let context = match &occurrence.worker_id {
                Some(worker_id) => format!("lost heartbeat from worker {worker_id}"),
                None => "lost heartbeat, no worker on record".to_string(),
            };
            reclaim(occurrence, now, context);
        }

        let workers_evicted: std::collections::HashSet<String> =
            lost_running.iter().filter_map(|occ| occ.worker_id.clone()).collect();

        let mut reclaimed: Vec<JobOccurrence> = Vec::with_capacity(stale_queued.len() + lost_running.len());
        reclaimed.extend(stale_queued);
        reclaimed.extend(lost_running);

        if reclaimed.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = reclaimed.iter().map(|occ| occ.id.to_string()).collect();
        self.store.update_occurrences_bulk(&reclaimed).await?;

        for occurrence in &reclaimed {
            if let Err(e) = self.scheduler_client.mark_job_as_completed(occurrence.job_id).await {
                warn!(job_id = %occurrence.job_id, error = %e, "failed to clear running marker for reclaimed occurrence");
            }
        }

        ZombieDetectorMetrics::sweep_completed(reclaimed.len() as u64, workers_evicted.len() as u64);
        self.publisher.publish_event("occurrences.updated", &ids).await;

        Ok(())
    }
}

/// Transitions an occurrence to `Unknown`, stamping `endTime`/`durationMs`
/// and recording `reason` as the exception context (§4.8). `Unknown` is
/// always a legal transition out of `Queued`/`Running` per the state
/// machine, so this never needs to check `can_transition_to`.
fn reclaim(occurrence: &mut JobOccurrence, now: chrono::DateTime<Utc>, reason: String) {
    let from = occurrence.status;
    occurrence.status = OccurrenceStatus::Unknown;
    occurrence.record_transition(from, OccurrenceStatus::Unknown);
    occurrence.end_time = Some(now);
    occurrence.duration_ms = occurrence
        .start_time
        .or(Some(occurrence.created_at))
        .map(|start| (now - start).num_milliseconds());
    occurrence.exception = Some(reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use milvaion_core::JobId;

    fn sample() -> JobOccurrence {
        JobOccurrence::new_queued(JobId::new(), "sendemail".into(), 1)
    }

    #[test]
    fn reclaim_transitions_queued_to_unknown() {
        let mut occurrence = sample();
        let now = Utc::now();
        reclaim(&mut occurrence, now, "never consumed".into());
        assert_eq!(occurrence.status, OccurrenceStatus::Unknown);
        assert_eq!(occurrence.end_time, Some(now));
        assert_eq!(occurrence.exception.as_deref(), Some("never consumed"));
    }

    #[test]
    fn reclaim_computes_duration_from_start_time_when_present() {
        let mut occurrence = sample();
        occurrence.status = OccurrenceStatus::Running;
        occurrence.start_time = Some(Utc::now() - chrono::Duration::seconds(30));
        let now = Utc::now();
        reclaim(&mut occurrence, now, "lost heartbeat".into());
        assert!(occurrence.duration_ms.unwrap() >= 30_000);
    }
}
