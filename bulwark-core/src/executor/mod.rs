//! Operation executors
//!
//! Each executor wraps one kind of external call with the same layers, in
//! this order: circuit-breaker gate, retry loop, per-attempt timeout, the
//! call itself, and start/complete/fail telemetry around the whole thing.
//!
//! The breaker sees one outcome per operation, after retries settle. An
//! operation whose retries all fail counts as a single breaker failure.

mod llm;
mod session;
mod tool;

pub use llm::LlmExecutor;
pub use session::SessionExecutor;
pub use tool::ToolExecutor;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use uuid::Uuid;

use crate::attrs;
use crate::error::{ErrorRecord, Result};
use crate::llm::TokenUsage;
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::retry::{RetryPolicy, with_retry_counted};
use crate::telemetry::Telemetry;

/// Kind of external call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Llm,
    Tool,
    Session,
    Resource,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Llm => "llm",
            OperationKind::Tool => "tool",
            OperationKind::Session => "session",
            OperationKind::Resource => "resource",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One externally visible call
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: Uuid,
    pub kind: OperationKind,
    /// Model name, tool name, session id, or resource type
    pub target: String,
    pub input: Value,
    /// No attempt runs past this instant
    pub deadline: Instant,
}

impl Operation {
    /// Create an operation whose deadline is `budget` from now
    pub fn new(
        kind: OperationKind,
        target: impl Into<String>,
        input: Value,
        budget: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            target: target.into(),
            input,
            deadline: Instant::now() + budget,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = deadline;
        self
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// Retry and timeout settings applied to each operation
#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    pub retry: RetryPolicy,
    /// Timeout for a single attempt
    pub timeout: Duration,
    /// Overall budget for the operation, across all attempts
    pub deadline: Duration,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
            deadline: Duration::from_secs(300),
        }
    }
}

impl ExecutionPolicy {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Per-kind executor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(with = "humantime_serde")]
    pub llm_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub tool_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Overall budget per operation
    #[serde(with = "humantime_serde")]
    pub deadline: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            llm_timeout: Duration::from_secs(60),
            tool_timeout: Duration::from_secs(30),
            session_timeout: Duration::from_secs(5),
            deadline: Duration::from_secs(300),
        }
    }
}

impl ExecutorConfig {
    /// Build the policy for one kind of operation
    pub fn policy(&self, kind: OperationKind, retry: RetryPolicy) -> ExecutionPolicy {
        let timeout = match kind {
            OperationKind::Llm => self.llm_timeout,
            OperationKind::Tool => self.tool_timeout,
            OperationKind::Session | OperationKind::Resource => self.session_timeout,
        };
        ExecutionPolicy {
            retry,
            timeout,
            deadline: self.deadline,
        }
    }
}

/// Resource usage reported with a result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub tokens: Option<TokenUsage>,
    /// Hex prefix of the sha256 of the call arguments
    pub args_hash: Option<String>,
}

/// Output of a successful operation
#[derive(Debug, Clone)]
pub struct ExecutionResult<T> {
    pub output: T,
    pub elapsed: Duration,
    pub attempts: u32,
    pub usage: ResourceUsage,
}

impl<T> ExecutionResult<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ExecutionResult<U> {
        ExecutionResult {
            output: f(self.output),
            elapsed: self.elapsed,
            attempts: self.attempts,
            usage: self.usage,
        }
    }
}

/// Short stable hash of JSON arguments
pub fn args_hash(args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(args.to_string().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Builds the timeout error for a kind: `(limit, elapsed)`
pub(crate) type TimeoutError<'a> = &'a (dyn Fn(Duration, Duration) -> ErrorRecord + Send + Sync);

/// Everything needed to run one operation under the shared policy layers
pub(crate) struct Guarded<'a> {
    pub operation: &'a Operation,
    pub policy: &'a ExecutionPolicy,
    pub breaker: &'a CircuitBreaker,
    pub breaker_key: &'a str,
    pub telemetry: &'a Telemetry,
    pub circuit_open: &'a (dyn Fn() -> ErrorRecord + Send + Sync),
    pub timeout_error: TimeoutError<'a>,
    /// Whether an error counts as a breaker failure
    pub counts_failure: fn(&ErrorRecord) -> bool,
}

/// Output and attempt count of a guarded call
pub(crate) struct Completed<T> {
    pub value: T,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl Guarded<'_> {
    /// Run `call` with breaker, retry, timeout, and telemetry applied
    pub async fn run<T, F, Fut>(self, call: F) -> Result<Completed<T>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let kind = self.operation.kind.as_str();
        self.telemetry.event(
            &format!("{}.start", kind),
            &attrs! {
                "target" => self.operation.target,
                "operation_id" => self.operation.id.to_string(),
            },
        );

        let outcome = self.attempt_all(call).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok((value, attempts)) => {
                self.report(kind, "complete", elapsed, attempts);
                Ok(Completed {
                    value,
                    attempts,
                    elapsed,
                })
            }
            Err((error, attempts)) => {
                self.report(kind, "fail", elapsed, attempts);
                self.telemetry.error(
                    &error,
                    &attrs! {
                        "target" => self.operation.target,
                        "operation_id" => self.operation.id.to_string(),
                        "attempts" => attempts,
                    },
                );
                Err(error)
            }
        }
    }

    async fn attempt_all<T, F, Fut>(
        &self,
        mut call: F,
    ) -> std::result::Result<(T, u32), (ErrorRecord, u32)>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.breaker.try_acquire(self.breaker_key) {
            return Err(((self.circuit_open)(), 0));
        }
        let mut probe = ProbeGuard {
            breaker: self.breaker,
            key: self.breaker_key,
            armed: true,
        };

        let deadline = self.operation.deadline;
        let base = self.policy.retry.clone();
        let retry = self
            .policy
            .retry
            .clone()
            .with_retry_if(move |e| Instant::now() < deadline && base.should_retry(e));

        let operation = self.operation;
        let configured = self.policy.timeout;
        let timeout_error = self.timeout_error;

        let result = with_retry_counted(&retry, |attempt| {
            let limit = configured.min(operation.remaining());
            let pending = call(attempt);
            async move {
                if limit.is_zero() {
                    return Err(timeout_error(configured, Duration::ZERO));
                }
                let started = Instant::now();
                match tokio::time::timeout(limit, pending).await {
                    Ok(result) => result,
                    Err(_) => Err(timeout_error(limit, started.elapsed())),
                }
            }
        })
        .await;

        match &result {
            Ok(_) => self.breaker.record_success(self.breaker_key),
            Err((error, _)) if (self.counts_failure)(error) => {
                self.breaker.record_failure(self.breaker_key)
            }
            Err(_) => self.breaker.release_probe(self.breaker_key),
        }
        probe.armed = false;

        result.map(|retried| (retried.value, retried.attempts))
    }

    fn report(&self, kind: &str, outcome: &str, elapsed: Duration, attempts: u32) {
        let elapsed_ms = elapsed.as_millis() as u64;
        self.telemetry.event(
            &format!("{}.{}", kind, outcome),
            &attrs! {
                "target" => self.operation.target,
                "operation_id" => self.operation.id.to_string(),
                "elapsed_ms" => elapsed_ms,
                "attempts" => attempts,
            },
        );
        self.telemetry.metric(
            &format!("{}.duration_ms", kind),
            elapsed_ms as f64,
            &attrs! { "target" => self.operation.target, "outcome" => outcome },
        );
    }
}

/// Report an operation rejected before any call was attempted
pub(crate) fn report_rejected(telemetry: &Telemetry, operation: &Operation, error: &ErrorRecord) {
    let attrs = attrs! {
        "target" => operation.target,
        "operation_id" => operation.id.to_string(),
        "elapsed_ms" => 0,
        "attempts" => 0,
    };
    telemetry.event(&format!("{}.fail", operation.kind), &attrs);
    telemetry.error(error, &attrs);
}

/// Frees a HalfOpen probe slot if the operation is dropped mid-call
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    key: &'a str,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_probe(self.key);
        }
    }
}
