//! Language-model call executor

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::warn;

use super::{ExecutionPolicy, ExecutionResult, Guarded, Operation, OperationKind, ResourceUsage};
use crate::attrs;
use crate::error::{ErrorKind, ErrorRecord, LlmFailure, Result};
use crate::llm::{LlmRequest, LlmResponse, LlmService, LlmStream};
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::telemetry::Telemetry;

/// Runs model calls under the shared policy layers, keyed by model name
pub struct LlmExecutor {
    service: Arc<dyn LlmService>,
    breaker: Arc<CircuitBreaker>,
    policy: ExecutionPolicy,
    telemetry: Telemetry,
}

impl std::fmt::Debug for LlmExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmExecutor")
            .field("model", &self.service.model_info().model_name)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl LlmExecutor {
    pub fn new(service: Arc<dyn LlmService>) -> Self {
        Self {
            service,
            breaker: Arc::new(CircuitBreaker::default()),
            policy: ExecutionPolicy::default().with_timeout(Duration::from_secs(60)),
            telemetry: Telemetry::default(),
        }
    }

    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn model_for(&self, request: &LlmRequest) -> String {
        request
            .model
            .clone()
            .unwrap_or_else(|| self.service.model_info().model_name)
    }

    fn operation(&self, model: &str, request: &LlmRequest) -> Result<Operation> {
        Ok(Operation::new(
            OperationKind::Llm,
            model,
            serde_json::to_value(request)?,
            self.policy.deadline,
        ))
    }

    /// Generate a complete response
    pub async fn generate(&self, request: LlmRequest) -> Result<ExecutionResult<LlmResponse>> {
        let model = self.model_for(&request);
        let operation = self.operation(&model, &request)?;

        let circuit_open = || circuit_open_error(&model);
        let timeout_error = |limit: Duration, _elapsed: Duration| timed_out(&model, limit);

        let completed = Guarded {
            operation: &operation,
            policy: &self.policy,
            breaker: &self.breaker,
            breaker_key: &model,
            telemetry: &self.telemetry,
            circuit_open: &circuit_open,
            timeout_error: &timeout_error,
            counts_failure: counts_against_breaker,
        }
        .run(|_| self.service.generate(&request))
        .await?;

        let tokens = completed.value.usage;
        Ok(ExecutionResult {
            output: completed.value,
            elapsed: completed.elapsed,
            attempts: completed.attempts,
            usage: ResourceUsage {
                tokens,
                args_hash: None,
            },
        })
    }

    /// Open a streaming response.
    ///
    /// Opening the stream runs under the full policy. Chunks are not retried:
    /// a chunk error is passed through to the caller, reported to telemetry,
    /// and counted as a breaker failure for the model.
    pub async fn generate_stream(&self, request: LlmRequest) -> Result<ExecutionResult<LlmStream>> {
        let model = self.model_for(&request);
        let operation = self.operation(&model, &request)?;

        let circuit_open = || circuit_open_error(&model);
        let timeout_error = |limit: Duration, _elapsed: Duration| timed_out(&model, limit);

        let completed = Guarded {
            operation: &operation,
            policy: &self.policy,
            breaker: &self.breaker,
            breaker_key: &model,
            telemetry: &self.telemetry,
            circuit_open: &circuit_open,
            timeout_error: &timeout_error,
            counts_failure: counts_against_breaker,
        }
        .run(|_| self.service.generate_stream(&request))
        .await?;

        let breaker = self.breaker.clone();
        let telemetry = self.telemetry.clone();
        let operation_id = operation.id.to_string();
        let stream = completed.value.inspect(move |chunk| {
            if let Err(error) = chunk {
                warn!(model = %model, "Stream chunk failed: {}", error.message());
                breaker.record_failure(&model);
                let attrs = attrs! {
                    "target" => model,
                    "operation_id" => operation_id,
                };
                telemetry.event("llm.stream.fail", &attrs);
                telemetry.error(error, &attrs);
            }
        });

        let output: LlmStream = Box::pin(stream);
        Ok(ExecutionResult {
            output,
            elapsed: completed.elapsed,
            attempts: completed.attempts,
            usage: ResourceUsage::default(),
        })
    }
}

fn circuit_open_error(model: &str) -> ErrorRecord {
    ErrorRecord::llm(
        LlmFailure::CircuitOpen,
        model,
        format!("Circuit open for model '{}'", model),
    )
}

fn timed_out(model: &str, limit: Duration) -> ErrorRecord {
    ErrorRecord::llm(
        LlmFailure::Timeout,
        model,
        format!("Model call timed out after {:?}", limit),
    )
}

/// Client errors (bad request, auth) say nothing about the model's health
fn counts_against_breaker(error: &ErrorRecord) -> bool {
    match error.kind() {
        ErrorKind::Llm {
            failure: LlmFailure::Status(status),
        } => *status >= 500 || *status == 408 || *status == 429,
        ErrorKind::Llm {
            failure: LlmFailure::CircuitOpen,
        } => false,
        ErrorKind::Config => false,
        _ => true,
    }
}
