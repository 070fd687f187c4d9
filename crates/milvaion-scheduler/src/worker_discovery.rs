//! Worker-discovery service (C10, §4.10): two independent consumers, one
//! per registration/heartbeat queue, both feeding `WorkerRegistry`.
//! Grounded in the source's `worker_registry.rs` registration endpoint,
//! split across two bus consumers since the spec moves registration and
//! heartbeat onto separate queues (§6) rather than one RPC surface.

use crate::bus::{self, HeartbeatEnvelope, RegistrationEnvelope};
use crate::metrics::WorkerRegistryMetrics;
use crate::redis::WorkerRegistry;
use chrono::Utc;
use futures::StreamExt;
use lapin::Channel;
use milvaion_core::{ConsumerConfig, WorkerInstance, WorkerInstanceStatus};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct WorkerDiscovery {
    registry: Arc<WorkerRegistry>,
    registration_channel: Channel,
    registration_queue: String,
    heartbeat_channel: Channel,
    heartbeat_queue: String,
    consumer_prefetch: u16,
}

impl WorkerDiscovery {
    #[must_use]
    pub fn new(
        registry: Arc<WorkerRegistry>,
        registration_channel: Channel,
        registration_queue: String,
        heartbeat_channel: Channel,
        heartbeat_queue: String,
        consumer_prefetch: u16,
    ) -> Self {
        Self { registry, registration_channel, registration_queue, heartbeat_channel, heartbeat_queue, consumer_prefetch }
    }

    pub async fn run(self, cancellation: CancellationToken) {
        let registration = run_registrations(
            self.registry.clone(),
            self.registration_channel,
            self.registration_queue,
            self.consumer_prefetch,
            cancellation.clone(),
        );
        let heartbeat = run_heartbeats(
            self.registry,
            self.heartbeat_channel,
            self.heartbeat_queue,
            self.consumer_prefetch,
            cancellation,
        );
        tokio::join!(registration, heartbeat);
    }
}

async fn run_registrations(
    registry: Arc<WorkerRegistry>,
    channel: Channel,
    queue_name: String,
    prefetch: u16,
    cancellation: CancellationToken,
) {
    let mut consumer = match bus::declare_and_consume(&channel, &queue_name, "worker-discovery-registration", prefetch).await {
        Ok(consumer) => consumer,
        Err(e) => {
            error!(error = %e, "worker-discovery registration consumer failed to start, exiting task");
            return;
        }
    };

    loop {
        tokio::select! {
            () = cancellation.cancelled() => {
                info!("worker-discovery registration consumer shutting down");
                break;
            }
            delivery = consumer.next() => {
                let Some(delivery) = delivery else {
                    warn!("worker-registration consumer stream ended, exiting task");
                    break;
                };
                let Ok(delivery) = delivery else {
                    warn!("worker-registration delivery error, skipping");
                    continue;
                };

                match serde_json::from_slice::<RegistrationEnvelope>(&delivery.data) {
                    Ok(registration) => {
                        apply_registration(&registry, registration).await;
                        WorkerRegistryMetrics::registration_received();
                    }
                    Err(e) => warn!(error = %e, "unparsable worker registration message, dropping"),
                }
                bus::ack(&delivery).await;
            }
        }
    }
}

async fn apply_registration(registry: &WorkerRegistry, registration: RegistrationEnvelope) {
    let now = Utc::now();
    let instance = WorkerInstance {
        instance_id: registration.instance_id.clone(),
        host_name: registration.host_name,
        ip_address: registration.ip_address,
        current_jobs: 0,
        last_heartbeat: now,
        registered_at: now,
        status: WorkerInstanceStatus::Online,
    };
    let consumers = registration
        .job_configs
        .into_iter()
        .map(|cfg| ConsumerConfig {
            job_name_in_worker: cfg.job_type,
            max_parallel_jobs: cfg.max_parallel_jobs,
            execution_timeout_seconds: cfg.execution_timeout_seconds,
        })
        .collect();

    if let Err(e) = registry
        .register_worker(&registration.worker_id, instance, registration.max_parallel_jobs, consumers)
        .await
    {
        warn!(worker_id = %registration.worker_id, error = %e, "failed to persist worker registration");
    }
}

async fn run_heartbeats(
    registry: Arc<WorkerRegistry>,
    channel: Channel,
    queue_name: String,
    prefetch: u16,
    cancellation: CancellationToken,
) {
    let mut consumer = match bus::declare_and_consume(&channel, &queue_name, "worker-discovery-heartbeat", prefetch).await {
        Ok(consumer) => consumer,
        Err(e) => {
            error!(error = %e, "worker-discovery heartbeat consumer failed to start, exiting task");
            return;
        }
    };

    loop {
        tokio::select! {
            () = cancellation.cancelled() => {
                info!("worker-discovery heartbeat consumer shutting down");
                break;
            }
            delivery = consumer.next() => {
                let Some(delivery) = delivery else {
                    warn!("worker-heartbeat consumer stream ended, exiting task");
                    break;
                };
                let Ok(delivery) = delivery else {
                    warn!("worker-heartbeat delivery error, skipping");
                    continue;
                };

                match serde_json::from_slice::<HeartbeatEnvelope>(&delivery.data) {
                    Ok(heartbeat) => {
                        WorkerRegistryMetrics::heartbeat_received();
                        match registry.update_heartbeat(&heartbeat.worker_id, &heartbeat.instance_id, heartbeat.current_jobs).await {
                            Ok(true) => {}
                            Ok(false) => warn!(
                                worker_id = %heartbeat.worker_id,
                                instance_id = %heartbeat.instance_id,
                                "heartbeat for unregistered worker instance, ignoring"
                            ),
                            Err(e) => warn!(worker_id = %heartbeat.worker_id, error = %e, "failed to persist heartbeat"),
                        }
                    }
                    Err(e) => warn!(error = %e, "unparsable worker heartbeat message, dropping"),
                }
                bus::ack(&delivery).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use milvaion_core::WorkerAggregate;

    #[test]
    fn registration_maps_job_configs_to_consumer_configs() {
        let mut aggregate = WorkerAggregate::new("email-workers");
        aggregate.consumers.push(ConsumerConfig {
            job_name_in_worker: "sendemail".into(),
            max_parallel_jobs: Some(5),
            execution_timeout_seconds: Some(60),
        });
        assert_eq!(aggregate.consumer("sendemail").unwrap().max_parallel_jobs, Some(5));
    }
}
