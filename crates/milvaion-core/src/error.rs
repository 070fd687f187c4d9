//! Unified error type for the control plane.
//!
//! Generalized from the source's `JobError` (retry/DLQ classification
//! methods) and `ArcanaError` (status/classification constructors) into a
//! single enum wide enough to cover the store, the KV/Redis layer, the bus,
//! and configuration — each component applies its own §7 policy by
//! matching on variant, not by string-matching a message.

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type MilvaionResult<T> = Result<T, MilvaionError>;

#[derive(Debug, Error)]
pub enum MilvaionError {
    /// The relational store is unreachable or a query failed transiently
    /// (connection reset, deadlock). Callers let the current iteration
    /// fail and rely on the next tick or message redelivery.
    #[error("store error: {0}")]
    Store(String),

    /// A foreign-key violation on insert — treated as a phantom-job cache
    /// entry, not a hard failure (see dispatcher §4.5 step 7).
    #[error("store constraint violation: {0}")]
    StoreConstraint(String),

    /// Entity not found where the caller expected one.
    #[error("not found: {0}")]
    NotFound(String),

    /// A Redis/KV command failed.
    #[error("kv error: {0}")]
    Kv(String),

    /// The circuit breaker guarding the KV layer is open; the caller
    /// should treat this as "skip this iteration", not a hard error.
    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    /// A distributed lock could not be acquired (another owner holds it).
    #[error("lock contention on '{0}'")]
    LockContention(String),

    /// The message bus connection or channel failed.
    #[error("bus error: {0}")]
    Bus(String),

    /// Publishing a dispatch message failed.
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// A cron expression could not be parsed.
    #[error("invalid cron expression '{0}': {1}")]
    InvalidCron(String, String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Catch-all for conditions that should not occur in a healthy system.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MilvaionError {
    /// True for errors that are expected to resolve themselves on retry
    /// (store/KV transients, circuit-open, lock contention) as opposed to
    /// errors that indicate a permanent problem with the input.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store(_)
                | Self::Kv(_)
                | Self::CircuitOpen(_)
                | Self::LockContention(_)
                | Self::Bus(_)
                | Self::PublishFailed(_)
        )
    }

    /// True when the KV/Redis circuit breaker tripped — the dispatcher's
    /// cue to treat the iteration as "skip", per §4.5.
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }

    /// True when a DLQ consumer should nack-with-requeue rather than drop
    /// the message, per §4.9 / §7.
    #[must_use]
    pub fn should_requeue(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Kv(_) | Self::Internal(_))
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for MilvaionError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".into()),
            sqlx::Error::Database(db_err) => {
                // MySQL 1452 = FK violation (dispatcher §4.5 step 7's phantom-job
                // case); 1062 = unique violation (FailedOccurrence.occurrence_id,
                // §8 property 8).
                match db_err.code().as_deref() {
                    Some("1452") | Some("1062") => Self::StoreConstraint(db_err.message().to_string()),
                    _ => Self::Store(err.to_string()),
                }
            }
            _ => Self::Store(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_open_is_retryable_and_flagged() {
        let err = MilvaionError::CircuitOpen("redis".into());
        assert!(err.is_retryable());
        assert!(err.is_circuit_open());
    }

    #[test]
    fn not_found_is_not_retryable() {
        let err = MilvaionError::NotFound("job:abc".into());
        assert!(!err.is_retryable());
        assert!(!err.should_requeue());
    }

    #[test]
    fn store_errors_should_requeue() {
        let err = MilvaionError::Store("connection reset".into());
        assert!(err.should_requeue());
    }
}
