//! # Bulwark - Resilience for Agent Orchestration
//!
//! Bulwark wraps every external call an agent makes (model requests, tool
//! invocations, session store access) in the same policy layers:
//! - Classified errors that decide what may be retried
//! - Exponential backoff with jitter and rate-limit hints
//! - Keyed circuit breakers that short-circuit failing dependencies
//! - Per-attempt timeouts bounded by an overall deadline
//! - Scoped resource lifecycles and health-checked pooling
//! - Concurrency-bounded and sequential tool pipelines
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bulwark_core::prelude::*;
//! use serde_json::{Value, json};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let registry = Arc::new(ToolRegistry::new());
//!     registry.register(Arc::new(HandlerTool::new(
//!         ToolMetadata::new("echo", "Echoes its arguments"),
//!         ToolSchema::empty(),
//!         |args: Value, _ctx: ToolContext| async move { Ok::<_, ErrorRecord>(args) },
//!     )))?;
//!
//!     let executor = ToolExecutor::new(registry);
//!     let result = executor
//!         .execute("echo", json!({"hello": "world"}), &ToolContext::new())
//!         .await?;
//!     println!("{} after {} attempt(s)", result.output, result.attempts);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **error**: the closed error taxonomy and retryability rules
//! - **resilience**: retry engine and circuit breaker
//! - **resource**: lifecycle manager and resource pool
//! - **executor**: LLM, tool and session executors over shared policy
//! - **pipeline**: parallel and sequential tool batches
//! - **config** / **logging**: figment-loaded settings and tracing setup

pub mod config;
pub mod error;
pub mod executor;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod resilience;
pub mod resource;
pub mod session;
pub mod telemetry;
pub mod tools;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::BulwarkConfig;
    pub use crate::error::{
        ErrorKind, ErrorRecord, LlmFailure, ResourceFailure, ResourceOperation, Result,
        SessionFailure, SessionOperation, ToolFailure,
    };
    pub use crate::executor::{
        ExecutionPolicy, ExecutionResult, ExecutorConfig, LlmExecutor, Operation, OperationKind,
        ResourceUsage, SessionExecutor, ToolExecutor,
    };
    pub use crate::llm::{
        LlmChunk, LlmRequest, LlmResponse, LlmService, LlmStream, Message, MessageRole, ModelInfo,
        TokenUsage,
    };
    pub use crate::logging::{LoggingConfig, init_tracing};
    pub use crate::pipeline::{PipelineError, PipelineStep, StepArgs, ToolInvocation, ToolPipeline};
    pub use crate::resilience::{
        CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryPolicy, with_retry,
    };
    pub use crate::resource::{
        FnResourceHandler, LifecycleConfig, PoolConfig, PoolStats, PooledResource,
        ResourceFactory, ResourceHandler, ResourceManager, ResourcePool,
    };
    pub use crate::session::{InMemorySessionStore, Session, SessionStore, StateDelta};
    pub use crate::telemetry::{InMemoryTelemetry, Telemetry, TelemetrySink, TracingTelemetry};
    pub use crate::tools::{
        HandlerTool, Tool, ToolContext, ToolMetadata, ToolRegistry, ToolSchema,
    };
}
