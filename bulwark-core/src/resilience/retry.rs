//! Retry Logic
//!
//! Implements exponential backoff with optional jitter. Attempts for one
//! operation are strictly sequential: attempt `n + 1` is not scheduled until
//! attempt `n` has settled.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ErrorRecord, Result};

/// Maximum fraction of the computed delay added as jitter
const JITTER_FRACTION: f64 = 0.10;

/// Predicate deciding whether an error is eligible for another attempt
pub type RetryPredicate = Arc<dyn Fn(&ErrorRecord) -> bool + Send + Sync>;

/// Retry policy
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Add up to 10% jitter to each delay
    pub jitter: bool,
    /// Retry eligibility predicate
    retry_if: RetryPredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
            retry_if: Arc::new(ErrorRecord::is_retryable),
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Create a policy with no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy for aggressive retries
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            ..Default::default()
        }
    }

    /// Builder: set max attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Builder: set base delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Builder: set max delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Builder: enable/disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Builder: replace the retry eligibility predicate
    pub fn with_retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ErrorRecord) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Arc::new(predicate);
        self
    }

    /// Whether policy permits retrying after this error
    pub fn should_retry(&self, error: &ErrorRecord) -> bool {
        (self.retry_if)(error)
    }

    /// Delay before the attempt following attempt `attempt` (1-indexed), without jitter
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt.saturating_sub(1));
        factor
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Delay after attempt `attempt` (1-indexed), with jitter if enabled
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.backoff_for_attempt(attempt);
        if !self.jitter {
            return delay;
        }

        let fraction = JITTER_FRACTION * rand::thread_rng().gen_range(0.0..1.0);
        delay + delay.mul_f64(fraction)
    }

    /// Delay after a failed attempt, honouring a rate-limit hint up to `max_delay`
    fn delay_after(&self, attempt: u32, error: &ErrorRecord) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        match error.retry_after() {
            Some(hint) => delay.max(hint.min(self.max_delay)),
            None => delay,
        }
    }
}

/// Serializable retry settings, convertible into a [`RetryPolicy`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Maximum delay between attempts
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Add jitter to prevent thundering herd
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay: policy.base_delay,
            max_delay: policy.max_delay,
            jitter: policy.jitter,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy::default()
            .with_max_attempts(config.max_attempts)
            .with_base_delay(config.base_delay)
            .with_max_delay(config.max_delay)
            .with_jitter(config.jitter)
    }
}

/// Retry state tracker
#[derive(Debug)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: u32,
    last_error: Option<ErrorRecord>,
}

impl RetryState {
    /// Create a new retry state
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            last_error: None,
        }
    }

    /// Check if another attempt is allowed after the last recorded error
    pub fn should_retry(&self) -> bool {
        if self.attempt >= self.policy.max_attempts {
            return false;
        }
        match &self.last_error {
            Some(error) => self.policy.should_retry(error),
            None => true,
        }
    }

    /// Record a failed attempt
    pub fn record_attempt(&mut self, error: ErrorRecord) {
        self.attempt += 1;
        self.last_error = Some(error);
    }

    /// Get the delay before the next attempt
    pub fn next_delay(&self) -> Duration {
        match &self.last_error {
            Some(error) => self.policy.delay_after(self.attempt, error),
            None => Duration::ZERO,
        }
    }

    /// Get number of attempts made so far
    pub fn current_attempt(&self) -> u32 {
        self.attempt
    }

    /// Get remaining attempts
    pub fn remaining_attempts(&self) -> u32 {
        self.policy.max_attempts.saturating_sub(self.attempt)
    }

    /// Get the last error
    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.last_error.as_ref()
    }

    /// Consume the state, yielding the last error
    pub fn into_last_error(self) -> Option<ErrorRecord> {
        self.last_error
    }
}

/// Outcome of a retried operation along with the number of attempts made
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Execute an async operation with retries.
///
/// `operation` receives the 1-indexed attempt number. On exhaustion the
/// last attempt's error is returned unchanged.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    with_retry_counted(policy, operation)
        .await
        .map(|retried| retried.value)
        .map_err(|(error, _)| error)
}

/// Like [`with_retry`] but also reports how many attempts were made
pub async fn with_retry_counted<F, Fut, T>(
    policy: &RetryPolicy,
    mut operation: F,
) -> std::result::Result<Retried<T>, (ErrorRecord, u32)>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation(attempt).await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                });
            }
            Err(error) => {
                if attempt >= policy.max_attempts || !policy.should_retry(&error) {
                    debug!(
                        attempts = attempt,
                        kind = error.kind().name(),
                        retryable = error.is_retryable(),
                        "Giving up after final attempt"
                    );
                    return Err((error, attempt));
                }

                let delay = policy.delay_after(attempt, &error);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    kind = error.kind().name(),
                    target = error.target(),
                    "Retrying after error: {}",
                    error.message()
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
