//! Circuit Breaker Pattern
//!
//! Prevents cascading failures by counting consecutive failures per key
//! (tool name, model name) and temporarily rejecting calls for a key once a
//! threshold is reached.
//!
//! A success while Closed resets the key's counter to zero. There is no
//! sliding window, so a low but steady failure rate interleaved with
//! successes never opens the circuit.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - calls pass through
    Closed,
    /// Circuit open - calls are rejected
    Open,
    /// Testing if the dependency recovered
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time to wait before letting a probe through
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a sensitive config (opens quickly)
    pub fn sensitive() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(15),
        }
    }

    /// Create a tolerant config (takes more failures to open)
    pub fn tolerant() -> Self {
        Self {
            failure_threshold: 10,
            reset_timeout: Duration::from_secs(60),
        }
    }

    /// Builder: set failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Builder: set reset timeout
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

/// Point-in-time view of one key's circuit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
}

/// Per-key counters; only mutated through [`CircuitBreaker`]
#[derive(Debug)]
struct CircuitRecord {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitRecord {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    /// Move Open to HalfOpen once the reset timeout has elapsed
    fn refresh(&mut self, key: &str, reset_timeout: Duration, now: Instant) {
        if self.state != CircuitState::Open {
            return;
        }
        let elapsed = self
            .opened_at
            .map(|opened| now.saturating_duration_since(opened))
            .unwrap_or(reset_timeout);
        if elapsed >= reset_timeout {
            debug!(key, "Circuit half-open, admitting probe");
            self.state = CircuitState::HalfOpen;
            self.probe_in_flight = false;
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
    }

    fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            last_failure: self.last_failure,
        }
    }
}

/// Keyed circuit breaker for external calls
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, CircuitRecord>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// Create with default config
    pub fn default_config() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get current state of a key
    pub fn state(&self, key: &str) -> CircuitState {
        self.snapshot(key).state
    }

    /// Get a snapshot of a key's counters
    pub fn snapshot(&self, key: &str) -> CircuitSnapshot {
        let mut circuits = self.circuits.lock();
        match circuits.get_mut(key) {
            Some(record) => {
                record.refresh(key, self.config.reset_timeout, Instant::now());
                record.snapshot()
            }
            None => CircuitRecord::new().snapshot(),
        }
    }

    /// Check whether a call for `key` may proceed.
    ///
    /// In HalfOpen a single probe is admitted; further calls are rejected
    /// until the probe is recorded as a success or failure.
    pub fn try_acquire(&self, key: &str) -> bool {
        let mut circuits = self.circuits.lock();
        let record = circuits
            .entry(key.to_string())
            .or_insert_with(CircuitRecord::new);
        record.refresh(key, self.config.reset_timeout, Instant::now());

        match record.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if record.probe_in_flight {
                    false
                } else {
                    record.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self, key: &str) {
        let mut circuits = self.circuits.lock();
        let Some(record) = circuits.get_mut(key) else {
            return;
        };

        match record.state {
            CircuitState::Closed => {
                record.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                info!(key, "Circuit closed after successful probe");
                record.state = CircuitState::Closed;
                record.consecutive_failures = 0;
                record.opened_at = None;
                record.probe_in_flight = false;
            }
            CircuitState::Open => {
                // Late result from a call admitted before the circuit opened
            }
        }
    }

    /// Record a failed call
    pub fn record_failure(&self, key: &str) {
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let record = circuits
            .entry(key.to_string())
            .or_insert_with(CircuitRecord::new);
        record.last_failure = Some(now);

        match record.state {
            CircuitState::Closed => {
                record.consecutive_failures += 1;
                if record.consecutive_failures >= self.config.failure_threshold {
                    info!(
                        key,
                        failures = record.consecutive_failures,
                        "Circuit opened"
                    );
                    record.open(now);
                }
            }
            CircuitState::HalfOpen => {
                info!(key, "Probe failed, circuit re-opened");
                record.consecutive_failures += 1;
                record.open(now);
            }
            CircuitState::Open => {}
        }
    }

    /// Manually reset a key's circuit
    pub fn reset(&self, key: &str) {
        self.circuits.lock().remove(key);
    }

    /// Execute an async operation with circuit breaker protection.
    ///
    /// `rejected` builds the error returned when the circuit is open;
    /// `counts` decides whether an error counts as a failure.
    pub async fn call<F, Fut, T, E>(
        &self,
        key: &str,
        rejected: impl FnOnce() -> E,
        counts: impl FnOnce(&E) -> bool,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if !self.try_acquire(key) {
            return Err(rejected());
        }

        match operation().await {
            Ok(value) => {
                self.record_success(key);
                Ok(value)
            }
            Err(error) => {
                if counts(&error) {
                    self.record_failure(key);
                } else {
                    self.release_probe(key);
                }
                Err(error)
            }
        }
    }

    /// Release a HalfOpen probe slot without counting the outcome
    pub fn release_probe(&self, key: &str) {
        if let Some(record) = self.circuits.lock().get_mut(key) {
            record.probe_in_flight = false;
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::default_config()
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("keys", &self.circuits.lock().len())
            .field("config", &self.config)
            .finish()
    }
}
