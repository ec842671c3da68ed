//! Tool Execution Pipeline
//!
//! Runs batches of tool calls through a [`ToolExecutor`], either
//! concurrently under a hard in-flight limit or as a sequential chain where
//! each step's arguments are derived from the previous step's output.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::error::{ErrorRecord, Result};
use crate::executor::{ExecutionResult, ToolExecutor};
use crate::tools::ToolContext;

/// One call in a parallel batch
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub tool: String,
    pub args: Value,
    pub context: ToolContext,
}

impl ToolInvocation {
    pub fn new(tool: impl Into<String>, args: Value) -> Self {
        Self {
            tool: tool.into(),
            args,
            context: ToolContext::default(),
        }
    }

    pub fn with_context(mut self, context: ToolContext) -> Self {
        self.context = context;
        self
    }
}

/// Maps the previous step's output to the next step's arguments
pub type ArgsMapper = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Where a step gets its arguments from
#[derive(Clone)]
pub enum StepArgs {
    Static(Value),
    Mapped(ArgsMapper),
}

impl std::fmt::Debug for StepArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepArgs::Static(args) => f.debug_tuple("Static").field(args).finish(),
            StepArgs::Mapped(_) => f.write_str("Mapped(<fn>)"),
        }
    }
}

impl StepArgs {
    fn resolve(&self, previous: &Value) -> Value {
        match self {
            StepArgs::Static(args) => args.clone(),
            StepArgs::Mapped(mapper) => mapper(previous),
        }
    }
}

/// One step of a sequential pipeline
#[derive(Debug, Clone)]
pub struct PipelineStep {
    pub tool: String,
    pub args: StepArgs,
}

impl PipelineStep {
    /// Step with fixed arguments
    pub fn new(tool: impl Into<String>, args: Value) -> Self {
        Self {
            tool: tool.into(),
            args: StepArgs::Static(args),
        }
    }

    /// Step whose arguments are computed from the previous output
    ///
    /// As the first step of a pipeline the mapper receives `Value::Null`.
    pub fn mapped<F>(tool: impl Into<String>, mapper: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self {
            tool: tool.into(),
            args: StepArgs::Mapped(Arc::new(mapper)),
        }
    }
}

/// A sequential pipeline stopped at a failing step
#[derive(Debug, Clone, thiserror::Error)]
#[error("Pipeline failed at step {failed_step} ('{tool}'): {error}")]
pub struct PipelineError {
    /// Results of the steps that succeeded, in order
    pub completed: Vec<ExecutionResult<Value>>,
    /// Zero-based index of the failing step
    pub failed_step: usize,
    pub tool: String,
    #[source]
    pub error: ErrorRecord,
}

/// Batch runner over a shared tool executor
#[derive(Debug, Clone)]
pub struct ToolPipeline {
    executor: Arc<ToolExecutor>,
}

impl ToolPipeline {
    pub fn new(executor: Arc<ToolExecutor>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &Arc<ToolExecutor> {
        &self.executor
    }

    /// Run every invocation with at most `limit` in flight.
    ///
    /// Results come back in input order. A failing call does not cancel its
    /// siblings; once all have settled, the first failure in input order is
    /// returned.
    pub async fn execute_parallel(
        &self,
        invocations: Vec<ToolInvocation>,
        limit: usize,
    ) -> Result<Vec<ExecutionResult<Value>>> {
        self.execute_parallel_settled(invocations, limit)
            .await?
            .into_iter()
            .collect()
    }

    /// Like [`execute_parallel`](Self::execute_parallel), but returns every
    /// call's outcome
    pub async fn execute_parallel_settled(
        &self,
        invocations: Vec<ToolInvocation>,
        limit: usize,
    ) -> Result<Vec<Result<ExecutionResult<Value>>>> {
        if limit == 0 {
            return Err(ErrorRecord::config("Concurrency limit must be at least 1"));
        }

        let total = invocations.len();
        debug!(total, limit, "Dispatching parallel tool calls");

        let semaphore = Arc::new(Semaphore::new(limit));
        let calls = invocations.into_iter().map(|invocation| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire_owned().await.map_err(|_| {
                    ErrorRecord::config("Pipeline semaphore closed before dispatch")
                })?;
                self.executor
                    .execute(&invocation.tool, invocation.args, &invocation.context)
                    .await
            }
        });

        let results = join_all(calls).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(total, failed, "Parallel tool calls settled");
        Ok(results)
    }

    /// Run steps one after another, feeding each output into the next step.
    ///
    /// Stops at the first failure, returning the results gathered so far.
    pub async fn execute_sequential(
        &self,
        steps: Vec<PipelineStep>,
        context: &ToolContext,
    ) -> std::result::Result<Vec<ExecutionResult<Value>>, PipelineError> {
        let mut completed: Vec<ExecutionResult<Value>> = Vec::with_capacity(steps.len());
        let mut previous = Value::Null;

        for (index, step) in steps.into_iter().enumerate() {
            let args = step.args.resolve(&previous);
            debug!(step = index, tool = %step.tool, "Running pipeline step");

            match self.executor.execute(&step.tool, args, context).await {
                Ok(result) => {
                    previous = result.output.clone();
                    completed.push(result);
                }
                Err(error) => {
                    info!(
                        step = index,
                        tool = %step.tool,
                        "Pipeline stopped: {}",
                        error.message()
                    );
                    return Err(PipelineError {
                        completed,
                        failed_step: index,
                        tool: step.tool,
                        error,
                    });
                }
            }
        }

        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, ToolFailure};
    use crate::executor::ExecutionPolicy;
    use crate::resilience::retry::RetryPolicy;
    use crate::tools::{HandlerTool, ToolMetadata, ToolRegistry, ToolSchema};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Gauge {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    fn pipeline(gauge: Arc<Gauge>, seen: Arc<Mutex<Vec<Value>>>) -> ToolPipeline {
        let registry = Arc::new(ToolRegistry::new());

        registry
            .register(Arc::new(HandlerTool::new(
                ToolMetadata::new("sleep", "Sleeps for args.ms"),
                ToolSchema::empty(),
                move |args: Value, _ctx: ToolContext| {
                    let gauge = gauge.clone();
                    async move {
                        let now = gauge.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        gauge.peak.fetch_max(now, Ordering::SeqCst);
                        let ms = args["ms"].as_u64().unwrap_or(0);
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        gauge.in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, ErrorRecord>(json!({ "slept": ms }))
                    }
                },
            )))
            .unwrap();

        registry
            .register(Arc::new(HandlerTool::new(
                ToolMetadata::new("value", "Returns args.x as value"),
                ToolSchema::empty(),
                move |args: Value, _ctx: ToolContext| {
                    seen.lock().push(args.clone());
                    async move { Ok::<_, ErrorRecord>(json!({ "value": args["x"].clone() })) }
                },
            )))
            .unwrap();

        registry
            .register(Arc::new(HandlerTool::new(
                ToolMetadata::new("fail", "Always fails"),
                ToolSchema::empty(),
                |_args: Value, _ctx: ToolContext| async {
                    Err::<Value, _>(ErrorRecord::tool(ToolFailure::Execution, "fail", "boom"))
                },
            )))
            .unwrap();

        let executor = ToolExecutor::new(registry)
            .with_policy(ExecutionPolicy::default().with_retry(RetryPolicy::no_retry()));
        ToolPipeline::new(Arc::new(executor))
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_respects_limit_and_order() {
        let gauge = Arc::new(Gauge::default());
        let pipeline = pipeline(gauge.clone(), Arc::default());

        let invocations = [50, 10, 40, 20, 30]
            .into_iter()
            .map(|ms| ToolInvocation::new("sleep", json!({ "ms": ms })))
            .collect();
        let results = pipeline.execute_parallel(invocations, 2).await.unwrap();

        let slept: Vec<u64> = results
            .iter()
            .map(|r| r.output["slept"].as_u64().unwrap())
            .collect();
        assert_eq!(slept, vec![50, 10, 40, 20, 30]);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
        assert_eq!(gauge.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_failure_waits_for_siblings() {
        let gauge = Arc::new(Gauge::default());
        let pipeline = pipeline(gauge.clone(), Arc::default());

        let invocations = vec![
            ToolInvocation::new("sleep", json!({ "ms": 100 })),
            ToolInvocation::new("fail", json!({})),
            ToolInvocation::new("missing", json!({})),
        ];
        let settled = pipeline
            .execute_parallel_settled(invocations.clone(), 3)
            .await
            .unwrap();
        assert!(settled[0].is_ok());
        assert_eq!(settled[1].as_ref().unwrap_err().message(), "boom");

        let err = pipeline.execute_parallel(invocations, 3).await.unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Tool {
                failure: ToolFailure::Execution
            }
        );
        assert_eq!(gauge.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_zero_limit_is_rejected() {
        let pipeline = pipeline(Arc::default(), Arc::default());
        let err = pipeline.execute_parallel(vec![], 0).await.unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_sequential_feeds_previous_output() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pipeline = pipeline(Arc::default(), seen.clone());

        let steps = vec![
            PipelineStep::new("value", json!({ "x": 1 })),
            PipelineStep::mapped("value", |prev| {
                json!({ "x": prev["value"].as_i64().unwrap_or(0) + 1 })
            }),
        ];
        let results = pipeline
            .execute_sequential(steps, &ToolContext::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[1].output, json!({ "value": 2 }));
        assert_eq!(*seen.lock(), vec![json!({ "x": 1 }), json!({ "x": 2 })]);
    }

    #[tokio::test]
    async fn test_sequential_stops_at_failure() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pipeline = pipeline(Arc::default(), seen.clone());

        let steps = vec![
            PipelineStep::mapped("value", |prev| json!({ "x": prev.is_null() })),
            PipelineStep::new("fail", json!({})),
            PipelineStep::new("value", json!({ "x": 3 })),
        ];
        let err = pipeline
            .execute_sequential(steps, &ToolContext::new())
            .await
            .unwrap_err();

        assert_eq!(err.failed_step, 1);
        assert_eq!(err.tool, "fail");
        assert_eq!(err.completed.len(), 1);
        assert_eq!(err.completed[0].output, json!({ "value": true }));
        assert_eq!(seen.lock().len(), 1);
    }
}
