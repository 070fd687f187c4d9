//! Wires configuration, the durable store, the Redis adapters, and the
//! message bus into the six long-running control-plane components (C5-C10),
//! then runs them to completion under one shared cancellation token.
//! Grounded in the source's `AppModuleBuilder`/`run_monolithic` shape
//! (arcana-server), generalized from axum/gRPC server startup to a
//! background-task fleet since this spec's external interface is the
//! message bus and KV store, not an HTTP/gRPC API (§1 Non-goals).

use lapin::Channel;
use milvaion_config::AppConfig;
use milvaion_core::{MilvaionError, MilvaionResult};
use milvaion_resilience::CircuitBreakerConfig;
use milvaion_scheduler::redis::{LockService, SchedulerClient, WorkerRegistry};
use milvaion_scheduler::{bus, redis, Dispatcher, FailedOccurrenceHandler, LogCollector, StatusTracker, WorkerDiscovery, ZombieDetector};
use milvaion_store::{create_pool as create_db_pool, DatabasePoolInterface, MySqlStore, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything the running server needs to hand back to `main` so it can
/// wait for graceful shutdown: the cancellation token to trip and the
/// join handles of every spawned component.
pub struct Server {
    cancellation: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    metrics_handle: Option<JoinHandle<()>>,
}

impl Server {
    /// Builds every adapter and component from `config` and spawns them
    /// all as background tasks sharing one `CancellationToken`. Start-up
    /// recovery and migrations run inline here, before any component is
    /// spawned, so a failure surfaces before the process looks "up".
    pub async fn start(config: AppConfig) -> MilvaionResult<Self> {
        let cancellation = CancellationToken::new();

        let db_pool = create_db_pool(&config.database).await?;
        db_pool.run_migrations().await?;
        let db_pool: Arc<dyn DatabasePoolInterface> = db_pool;
        let store: Arc<dyn Store> = Arc::new(MySqlStore::new(db_pool));

        let redis_pool = redis::create_pool(&config.redis.url, config.redis.pool_size as usize).await?;
        let breaker_config = CircuitBreakerConfig {
            failure_threshold: config.redis.circuit_breaker_failure_threshold,
            timeout: Duration::from_secs(config.redis.circuit_breaker_cooldown_secs),
            ..CircuitBreakerConfig::default()
        };
        let scheduler_client = Arc::new(SchedulerClient::new(redis_pool.clone(), config.redis.key_prefix.clone(), breaker_config));
        let lock_service = Arc::new(LockService::new(redis_pool.clone(), config.redis.key_prefix.clone()));
        let worker_registry = Arc::new(WorkerRegistry::new(redis_pool, config.redis.key_prefix.clone()));

        let bus_pool = bus::create_pool(&config.bus.url).await?;
        let publisher = Arc::new(bus::BusPublisher::new(bus_pool.clone(), config.bus.clone()));
        publisher.declare_topology().await?;

        let mut tasks = Vec::new();

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            scheduler_client.clone(),
            lock_service,
            worker_registry.clone(),
            publisher.clone(),
            config.dispatcher.clone(),
            config.worker_health.clone(),
        ));
        tasks.push(spawn("dispatcher", dispatcher.run(cancellation.clone())));

        let status_tracker_channel = channel(&bus_pool).await?;
        let status_tracker = StatusTracker::new(
            store.clone(),
            scheduler_client.clone(),
            worker_registry.clone(),
            status_tracker_channel,
            config.bus.status_updates_queue.clone(),
            config.status_tracker.clone(),
            config.auto_disable.clone(),
        );
        tasks.push(spawn("status-tracker", status_tracker.run(cancellation.clone())));

        let log_collector_channel = channel(&bus_pool).await?;
        let log_collector = LogCollector::new(store.clone(), log_collector_channel, config.bus.worker_logs_queue.clone(), config.log_collector.clone());
        tasks.push(spawn("log-collector", log_collector.run(cancellation.clone())));

        let zombie_detector = ZombieDetector::new(store.clone(), scheduler_client, publisher, config.zombie_detector.clone());
        tasks.push(spawn("zombie-detector", zombie_detector.run(cancellation.clone())));

        let failed_occurrence_channel = channel(&bus_pool).await?;
        let failed_occurrence_handler = FailedOccurrenceHandler::new(store, failed_occurrence_channel, config.bus.failed_occurrences_queue.clone());
        tasks.push(spawn("failed-occurrence-handler", failed_occurrence_handler.run(cancellation.clone())));

        let registration_channel = channel(&bus_pool).await?;
        let heartbeat_channel = channel(&bus_pool).await?;
        let worker_discovery = WorkerDiscovery::new(
            worker_registry,
            registration_channel,
            config.bus.worker_registration_queue.clone(),
            heartbeat_channel,
            config.bus.worker_heartbeat_queue.clone(),
            config.bus.prefetch_count,
        );
        tasks.push(spawn("worker-discovery", worker_discovery.run(cancellation.clone())));

        let metrics_handle = if config.observability.metrics_enabled {
            Some(spawn_metrics_exporter(&config)?)
        } else {
            None
        };

        info!("all control-plane components started");
        Ok(Self { cancellation, tasks, metrics_handle })
    }

    /// Trips the shared cancellation token and waits for every component
    /// to drain its in-flight batch and return.
    pub async fn shutdown(self) {
        self.cancellation.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "component task panicked during shutdown");
            }
        }
        if let Some(handle) = self.metrics_handle {
            handle.abort();
        }
        info!("server shutdown complete");
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}

fn spawn(name: &'static str, fut: impl std::future::Future<Output = ()> + Send + 'static) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(component = name, "component started");
        fut.await;
        info!(component = name, "component stopped");
    })
}

async fn channel(pool: &deadpool_lapin::Pool) -> MilvaionResult<Channel> {
    let conn = pool.get().await.map_err(|e| MilvaionError::Bus(format!("failed to acquire amqp connection: {e}")))?;
    conn.create_channel().await.map_err(|e| MilvaionError::Bus(format!("failed to create amqp channel: {e}")))
}

fn spawn_metrics_exporter(config: &AppConfig) -> MilvaionResult<JoinHandle<()>> {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::net::SocketAddr;

    milvaion_scheduler::metrics::register_metrics();

    let addr: SocketAddr = format!("{}:{}", config.server.metrics_host, config.server.metrics_port)
        .parse()
        .map_err(|e| MilvaionError::Configuration(format!("invalid metrics listen address: {e}")))?;

    let builder = PrometheusBuilder::new().with_http_listener(addr);
    let (recorder, exporter_fut) = builder
        .build()
        .map_err(|e| MilvaionError::Configuration(format!("failed to build prometheus exporter: {e}")))?;
    metrics::set_global_recorder(recorder).map_err(|e| MilvaionError::Internal(format!("failed to install metrics recorder: {e}")))?;

    info!(%addr, path = %config.observability.metrics_path, "metrics endpoint listening");
    Ok(tokio::spawn(async move {
        if let Err(e) = exporter_fut.await {
            warn!(error = %e, "prometheus exporter task exited");
        }
    }))
}
