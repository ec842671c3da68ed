//! Tool trait and metadata definitions

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::validation::{ValidationError, validate_args};
use crate::error::Result;

/// Tool metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMetadata {
    /// Tool name (unique identifier)
    pub name: String,

    /// Human-readable description
    pub description: String,

    /// Tool version
    pub version: Option<String>,

    /// Tags for categorization
    pub tags: Vec<String>,
}

impl ToolMetadata {
    /// Create new metadata with required fields
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            version: None,
            tags: Vec::new(),
        }
    }

    /// Set version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Add a tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// JSON Schema for tool parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    /// JSON Schema for input parameters
    pub parameters: Value,

    /// Reject arguments not declared in `properties`
    pub strict: bool,
}

impl ToolSchema {
    /// Create a schema from a JSON Schema value
    pub fn new(parameters: Value) -> Self {
        Self {
            parameters,
            strict: false,
        }
    }

    /// Create an empty schema (tool takes no parameters)
    pub fn empty() -> Self {
        Self::new(serde_json::json!({
            "type": "object",
            "properties": {}
        }))
    }

    /// Set strict mode
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

/// Context provided to tool execution
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Agent ID making the call
    pub agent_id: Option<String>,

    /// Trace ID for correlation
    pub trace_id: Option<String>,

    /// Cancels the call when triggered
    pub cancellation: Option<CancellationToken>,

    /// Additional context values
    pub extra: Value,
}

impl ToolContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }

    /// Whether the caller has cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

/// Core tool trait
///
/// Tools report failures as [`ErrorRecord`](crate::error::ErrorRecord)s of
/// kind `Tool`. Use `ToolFailure::Transient` for failures worth retrying and
/// `ToolFailure::Execution` for permanent ones.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get tool metadata
    fn metadata(&self) -> &ToolMetadata;

    /// Get tool name (convenience method)
    fn name(&self) -> &str {
        &self.metadata().name
    }

    /// Get tool description (convenience method)
    fn description(&self) -> &str {
        &self.metadata().description
    }

    /// Get the JSON schema for this tool's parameters
    fn schema(&self) -> ToolSchema;

    /// Validate input arguments before execution
    ///
    /// The default checks the arguments against [`Tool::schema`].
    fn validate(&self, args: &Value) -> std::result::Result<(), Vec<ValidationError>> {
        validate_args(&self.schema(), args)
    }

    /// Run the tool. Only called with arguments that passed validation.
    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<Value>;
}

/// Handler trait for simpler tool implementations
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, args: Value, ctx: &ToolContext) -> Result<Value>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn handle(&self, args: Value, ctx: &ToolContext) -> Result<Value> {
        (self)(args, ctx.clone()).await
    }
}

/// Wrapper to turn a [`ToolHandler`] into a full [`Tool`]
pub struct HandlerTool<H: ToolHandler> {
    metadata: ToolMetadata,
    schema: ToolSchema,
    handler: H,
}

impl<H: ToolHandler> HandlerTool<H> {
    pub fn new(metadata: ToolMetadata, schema: ToolSchema, handler: H) -> Self {
        Self {
            metadata,
            schema,
            handler,
        }
    }
}

#[async_trait]
impl<H: ToolHandler + 'static> Tool for HandlerTool<H> {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    fn schema(&self) -> ToolSchema {
        self.schema.clone()
    }

    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<Value> {
        self.handler.handle(args, ctx).await
    }
}

/// Type alias for shared tools
pub type BoxedTool = Arc<dyn Tool>;
