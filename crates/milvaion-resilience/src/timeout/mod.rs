//! Timeout wrapper for async operations.

use milvaion_core::MilvaionError;
use std::time::Duration;

/// Wraps an async operation with a timeout, surfacing expiry as
/// `MilvaionError::Internal` — the caller decides whether that's
/// retryable via its own classification, since a KV timeout and a bus
/// publish timeout are handled differently (§7).
pub async fn with_timeout<F, Fut, T>(duration: Duration, f: F) -> Result<T, MilvaionError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, MilvaionError>>,
{
    tokio::time::timeout(duration, f())
        .await
        .map_err(|_| MilvaionError::Internal(format!("operation timed out after {:?}", duration)))?
}

/// Per-concern default timeouts, mirrored from the scheduler's
/// configuration defaults (§6) so code that doesn't read config directly
/// (e.g. unit tests) still has a sane fallback.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub default_timeout: Duration,
    pub kv_timeout: Duration,
    pub bus_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            kv_timeout: Duration::from_secs(5),
            bus_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_within_budget() {
        let result = with_timeout(Duration::from_secs(1), || async { Ok::<_, MilvaionError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn expires_past_budget() {
        let result = with_timeout(Duration::from_millis(10), || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, MilvaionError>(42)
        })
        .await;

        assert!(result.is_err());
    }
}
