//! Retry and circuit-breaking primitives shared by every executor

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use retry::{
    Retried, RetryConfig, RetryPolicy, RetryPredicate, RetryState, with_retry, with_retry_counted,
};
