//! Scheduling and execution control plane: the dispatcher (C5), status
//! tracker (C6), log collector (C7), zombie detector (C8), failed-occurrence
//! handler (C9), and worker-discovery service (C10), plus the Redis (C1-C3)
//! and message-bus (C4) adapters they share.

pub mod bus;
pub mod cron;
pub mod dispatcher;
pub mod failed_occurrence_handler;
pub mod log_collector;
pub mod metrics;
pub mod redis;
pub mod status_tracker;
pub mod worker_discovery;
pub mod zombie_detector;

pub use dispatcher::Dispatcher;
pub use failed_occurrence_handler::FailedOccurrenceHandler;
pub use log_collector::LogCollector;
pub use status_tracker::StatusTracker;
pub use worker_discovery::WorkerDiscovery;
pub use zombie_detector::ZombieDetector;
