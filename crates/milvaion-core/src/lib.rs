//! # Milvaion Core
//!
//! Foundational types shared by every Milvaion crate: typed ids, the
//! durable domain entities (`ScheduledJob`, `JobOccurrence`,
//! `FailedOccurrence`, `Worker`), and the unified error type.

pub mod domain;
pub mod error;
pub mod id;

pub use domain::*;
pub use error::{MilvaionError, MilvaionResult};
pub use id::{FailedOccurrenceId, JobId, OccurrenceId};
