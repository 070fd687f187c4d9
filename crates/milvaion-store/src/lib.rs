//! # Milvaion Store
//!
//! The durable relational store: a [`Store`] trait plus a `sqlx`-backed
//! MySQL implementation covering `ScheduledJob`, `JobOccurrence`, and
//! `FailedOccurrence` persistence, including the bulk/FK-aware operations
//! the dispatcher needs on its hot path.

mod mysql;
mod traits;

pub use mysql::{create_pool, DatabasePool, DatabasePoolInterface, MySqlStore};
pub use traits::Store;

#[cfg(any(test, feature = "mock"))]
pub use traits::MockStore;
