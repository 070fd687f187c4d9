//! The dispatcher (C5, §4.5): polls the Redis time index for due jobs,
//! fences concurrent dispatch attempts with a per-job lock, persists and
//! publishes new occurrences, reschedules recurring jobs, and runs the
//! start-up recovery and dispatch-retry sweeps on their own intervals.
//! Grounded in the source's `scheduler.rs` control loop (leader-elected
//! `tokio::select!` over shutdown/poll-interval ticks), generalized from
//! single-exchange enqueue to the full dispatch-persist-publish-reschedule
//! cycle this spec requires, and from the source's `worker.rs` for the
//! bounded-parallelism publish step.

mod iteration;
mod retry_sweep;
mod startup;

use crate::bus::BusPublisher;
use crate::metrics::DispatcherMetrics;
use crate::redis::{LockService, SchedulerClient, WorkerRegistry};
use milvaion_config::{DispatcherConfig, WorkerHealthConfig};
use milvaion_store::Store;
use std::sync::Arc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct Dispatcher {
    store: Arc<dyn Store>,
    scheduler_client: Arc<SchedulerClient>,
    lock_service: Arc<LockService>,
    worker_registry: Arc<WorkerRegistry>,
    publisher: Arc<BusPublisher>,
    config: DispatcherConfig,
    worker_health: WorkerHealthConfig,
    /// Lock owner token for this process, used to fence `try_acquire_lock`
    /// / `release_lock` pairs against other dispatcher instances.
    instance_id: String,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        scheduler_client: Arc<SchedulerClient>,
        lock_service: Arc<LockService>,
        worker_registry: Arc<WorkerRegistry>,
        publisher: Arc<BusPublisher>,
        config: DispatcherConfig,
        worker_health: WorkerHealthConfig,
    ) -> Self {
        Self {
            store,
            scheduler_client,
            lock_service,
            worker_registry,
            publisher,
            config,
            worker_health,
            instance_id: format!("dispatcher-{}", uuid::Uuid::now_v7()),
        }
    }

    /// Runs the dispatcher until `cancellation` fires: optional start-up
    /// recovery, then a `tokio::select!` over the poll tick (main
    /// 11-step iteration) and the retry-sweep tick, both logging and
    /// continuing on error rather than exiting the task (§4.5: a failed
    /// iteration just waits for the next tick).
    pub async fn run(self: Arc<Self>, cancellation: CancellationToken) {
        if self.config.enable_startup_recovery {
            if let Err(e) = self.startup_recovery(&cancellation).await {
                error!(error = %e, "dispatcher start-up recovery failed, continuing into normal operation");
            }
        }

        let mut poll_tick = time::interval(self.config.poll_interval());
        let mut retry_tick = time::interval(self.config.retry_sweep_interval());
        let mut consecutive_failures: u32 = 0;

        info!("dispatcher entering main loop");
        loop {
            tokio::select! {
                () = cancellation.cancelled() => {
                    info!("dispatcher shutting down");
                    break;
                }
                _ = poll_tick.tick() => {
                    let started = std::time::Instant::now();
                    match self.run_iteration().await {
                        Ok(dispatched) => {
                            consecutive_failures = 0;
                            DispatcherMetrics::iteration_completed(started.elapsed().as_secs_f64());
                            if dispatched > 0 {
                                info!(dispatched, "dispatcher iteration completed");
                            }
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            DispatcherMetrics::consecutive_failures(consecutive_failures);
                            error!(error = %e, consecutive_failures, "dispatcher iteration failed");
                            if consecutive_failures >= self.config.max_consecutive_failures {
                                error!(
                                    consecutive_failures,
                                    backoff_secs = self.config.failure_backoff_secs,
                                    "dispatcher hit max consecutive failures, backing off"
                                );
                                tokio::select! {
                                    () = cancellation.cancelled() => break,
                                    () = time::sleep(self.config.failure_backoff()) => {}
                                }
                                consecutive_failures = 0;
                            }
                        }
                    }
                }
                _ = retry_tick.tick() => {
                    if let Err(e) = self.run_retry_sweep().await {
                        error!(error = %e, "dispatch-retry sweep failed");
                    }
                }
            }
        }
    }
}
