//! # Milvaion Resilience
//!
//! Resilience patterns shared by the scheduler's control-plane components:
//! a circuit breaker (used both to guard the KV/Redis client and to drive
//! per-job auto-disable), a retry policy (the dispatcher's capped
//! exponential backoff), and a timeout wrapper.

pub mod circuit_breaker;
pub mod retry;
pub mod timeout;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
pub use retry::RetryPolicy;
pub use timeout::with_timeout;
