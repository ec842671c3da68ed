//! Tool call executor

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use super::{
    ExecutionPolicy, ExecutionResult, Guarded, Operation, OperationKind, ResourceUsage, args_hash,
    report_rejected,
};
use crate::error::{ErrorKind, ErrorRecord, Result, ToolFailure};
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::telemetry::Telemetry;
use crate::tools::{Tool, ToolContext, ToolRegistry, invalid_arguments};

/// Runs registered tools under the shared policy layers
///
/// Arguments are validated against the tool's schema before the breaker is
/// consulted, so malformed calls never count against it.
#[derive(Debug)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    breaker: Arc<CircuitBreaker>,
    policy: ExecutionPolicy,
    telemetry: Telemetry,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            breaker: Arc::new(CircuitBreaker::default()),
            policy: ExecutionPolicy::default(),
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

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    /// Validate `args` and run the named tool
    pub async fn execute(
        &self,
        tool_name: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<ExecutionResult<Value>> {
        let hash = args_hash(&args);
        let operation = Operation::new(
            OperationKind::Tool,
            tool_name,
            args.clone(),
            self.policy.deadline,
        );

        let tool = match self.prepare(tool_name, &args, ctx) {
            Ok(tool) => tool,
            Err(error) => {
                debug!(tool = tool_name, "Tool call rejected: {}", error.message());
                report_rejected(&self.telemetry, &operation, &error);
                return Err(error);
            }
        };

        let circuit_open = || {
            ErrorRecord::tool(
                ToolFailure::CircuitOpen,
                tool_name,
                format!("Circuit open for tool '{}'", tool_name),
            )
        };
        let timeout_error =
            |limit: Duration, elapsed: Duration| ErrorRecord::tool_timeout(tool_name, limit, elapsed);

        let completed = Guarded {
            operation: &operation,
            policy: &self.policy,
            breaker: &self.breaker,
            breaker_key: tool_name,
            telemetry: &self.telemetry,
            circuit_open: &circuit_open,
            timeout_error: &timeout_error,
            counts_failure: counts_against_breaker,
        }
        .run(|_| run_cancellable(tool.as_ref(), args.clone(), ctx))
        .await?;

        Ok(ExecutionResult {
            output: completed.value,
            elapsed: completed.elapsed,
            attempts: completed.attempts,
            usage: ResourceUsage {
                tokens: None,
                args_hash: Some(hash),
            },
        })
    }

    /// Resolve the tool and check the call can be made at all
    fn prepare(&self, tool_name: &str, args: &Value, ctx: &ToolContext) -> Result<Arc<dyn Tool>> {
        let tool = self.registry.get(tool_name)?;
        if ctx.is_cancelled() {
            return Err(ErrorRecord::tool(
                ToolFailure::Cancelled,
                tool_name,
                "Cancelled before execution",
            ));
        }
        tool.validate(args)
            .map_err(|errors| invalid_arguments(tool_name, &errors))?;
        Ok(tool)
    }
}

async fn run_cancellable(tool: &dyn Tool, args: Value, ctx: &ToolContext) -> Result<Value> {
    match &ctx.cancellation {
        Some(token) => {
            tokio::select! {
                _ = token.cancelled() => Err(ErrorRecord::tool(
                    ToolFailure::Cancelled,
                    tool.name(),
                    "Execution cancelled",
                )),
                result = tool.run(args, ctx) => result,
            }
        }
        None => tool.run(args, ctx).await,
    }
}

/// Caller-side problems do not say anything about the tool's health
fn counts_against_breaker(error: &ErrorRecord) -> bool {
    !matches!(
        error.kind(),
        ErrorKind::Tool {
            failure: ToolFailure::NotFound
                | ToolFailure::InvalidArguments
                | ToolFailure::Cancelled
                | ToolFailure::CircuitOpen
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::resilience::retry::RetryPolicy;
    use crate::telemetry::InMemoryTelemetry;
    use crate::tools::{HandlerTool, ToolMetadata, ToolSchema};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        executor: ToolExecutor,
        sink: Arc<InMemoryTelemetry>,
        calls: Arc<AtomicU32>,
    }

    /// Registers `search`, which fails transiently `failures` times first
    fn fixture(failures: u32) -> Fixture {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(Arc::new(HandlerTool::new(
                ToolMetadata::new("search", "Searches"),
                ToolSchema::new(json!({
                    "type": "object",
                    "properties": { "query": { "type": "string" } },
                    "required": ["query"]
                })),
                move |args: Value, _ctx: ToolContext| {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < failures {
                            Err(ErrorRecord::tool(ToolFailure::Transient, "search", "reset"))
                        } else {
                            Ok(json!({ "hits": [args["query"].clone()] }))
                        }
                    }
                },
            )))
            .unwrap();
        registry
            .register(Arc::new(HandlerTool::new(
                ToolMetadata::new("slow", "Never finishes"),
                ToolSchema::empty(),
                |_args: Value, _ctx: ToolContext| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok::<_, ErrorRecord>(Value::Null)
                },
            )))
            .unwrap();

        let sink = Arc::new(InMemoryTelemetry::new());
        let executor = ToolExecutor::new(registry)
            .with_policy(
                ExecutionPolicy::default()
                    .with_retry(
                        RetryPolicy::default()
                            .with_base_delay(Duration::from_millis(1))
                            .with_jitter(false),
                    )
                    .with_timeout(Duration::from_millis(200)),
            )
            .with_circuit_breaker(Arc::new(CircuitBreaker::new(
                CircuitBreakerConfig::default().with_failure_threshold(2),
            )))
            .with_telemetry(Telemetry::new(sink.clone()));

        Fixture {
            executor,
            sink,
            calls,
        }
    }

    #[tokio::test]
    async fn test_execute_with_retry() {
        let f = fixture(2);
        let result = f
            .executor
            .execute("search", json!({"query": "rust"}), &ToolContext::new())
            .await
            .unwrap();

        assert_eq!(result.output, json!({"hits": ["rust"]}));
        assert_eq!(result.attempts, 3);
        assert_eq!(result.usage.args_hash.as_deref().map(str::len), Some(16));
        assert_eq!(f.sink.event_names(), vec!["tool.start", "tool.complete"]);
    }

    #[tokio::test]
    async fn test_invalid_args_skip_breaker_and_call() {
        let f = fixture(0);
        for _ in 0..5 {
            let err = f
                .executor
                .execute("search", json!({"query": 7}), &ToolContext::new())
                .await
                .unwrap_err();
            assert_eq!(
                err.kind(),
                &ErrorKind::Tool {
                    failure: ToolFailure::InvalidArguments
                }
            );
        }

        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            f.executor.circuit_breaker().state("search"),
            CircuitState::Closed
        );
        assert_eq!(f.sink.count_events("tool.fail"), 5);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let f = fixture(0);
        let err = f
            .executor
            .execute("missing", json!({}), &ToolContext::new())
            .await
            .unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Tool {
                failure: ToolFailure::NotFound
            }
        );
        assert_eq!(
            f.executor.circuit_breaker().snapshot("missing").consecutive_failures,
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_open_circuit() {
        let f = fixture(0);
        for _ in 0..2 {
            let err = f
                .executor
                .execute("slow", json!({}), &ToolContext::new())
                .await
                .unwrap_err();
            assert!(matches!(err.kind(), ErrorKind::ToolTimeout { .. }));
        }

        assert_eq!(f.executor.circuit_breaker().state("slow"), CircuitState::Open);
        let err = f
            .executor
            .execute("slow", json!({}), &ToolContext::new())
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(err.target(), "slow");
    }

    #[tokio::test]
    async fn test_cancellation() {
        let f = fixture(0);
        let token = CancellationToken::new();
        let ctx = ToolContext::new().with_cancellation(token.clone());

        let cancel = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        };
        let (result, _) = tokio::join!(f.executor.execute("slow", json!({}), &ctx), cancel);

        let err = result.unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Tool {
                failure: ToolFailure::Cancelled
            }
        );
        assert_eq!(f.executor.circuit_breaker().snapshot("slow").consecutive_failures, 0);

        let err = f
            .executor
            .execute("search", json!({"query": "q"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::Tool {
                failure: ToolFailure::Cancelled
            }
        ));
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }
}
