//! Error taxonomy for Bulwark operations
//!
//! Every failure surfaced to a caller is an [`ErrorRecord`]. The record's
//! [`ErrorKind`] is a closed sum type, so retry and circuit-breaker logic can
//! match on it exhaustively.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Result type for Bulwark operations
pub type Result<T> = std::result::Result<T, ErrorRecord>;

/// HTTP status codes from a model endpoint that warrant another attempt
const RETRYABLE_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Why a language-model call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "status", rename_all = "snake_case")]
pub enum LlmFailure {
    /// Transport-level failure reaching the endpoint
    Request,
    /// Endpoint answered with a non-success status code
    Status(u16),
    /// Call exceeded its deadline
    Timeout,
    /// Circuit breaker rejected the call without attempting it
    CircuitOpen,
    /// Streaming response broke mid-way
    Stream,
}

/// Why a tool call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailure {
    /// Arguments did not match the tool's declared schema
    InvalidArguments,
    /// No tool registered under the requested name
    NotFound,
    /// Tool ran and reported a permanent failure
    Execution,
    /// Tool ran and reported a transient failure
    Transient,
    /// Circuit breaker rejected the call without attempting it
    CircuitOpen,
    /// Caller cancelled the call
    Cancelled,
}

/// Session store operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOperation {
    Create,
    Get,
    Update,
    Delete,
    List,
}

impl fmt::Display for SessionOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionOperation::Create => "create",
            SessionOperation::Get => "get",
            SessionOperation::Update => "update",
            SessionOperation::Delete => "delete",
            SessionOperation::List => "list",
        };
        f.write_str(name)
    }
}

/// Why a session operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionFailure {
    /// Caller's expected version does not match the stored version
    VersionConflict { expected: u64, actual: u64 },
    /// Session does not exist
    NotFound,
    /// Backing store failed
    Store,
    /// Store call exceeded its deadline
    Timeout,
    /// Circuit breaker rejected the call without attempting it
    CircuitOpen,
}

/// Resource lifecycle operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceOperation {
    Acquire,
    Release,
    Create,
    HealthCheck,
    Destroy,
}

impl fmt::Display for ResourceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceOperation::Acquire => "acquire",
            ResourceOperation::Release => "release",
            ResourceOperation::Create => "create",
            ResourceOperation::HealthCheck => "health_check",
            ResourceOperation::Destroy => "destroy",
        };
        f.write_str(name)
    }
}

/// Why a resource operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceFailure {
    /// Operation exceeded its timeout
    Timeout,
    /// Pool is at capacity with nothing idle
    Exhausted,
    /// Underlying acquire/release/create call failed
    Failed,
    /// Pool has been shut down
    ShutDown,
}

/// Closed set of error kinds with their kind-specific fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
    /// Language-model endpoint failure
    Llm { failure: LlmFailure },

    /// Upstream rate limit; `retry_after` is the server's hint, if any
    RateLimit {
        #[serde(default, with = "humantime_serde")]
        retry_after: Option<Duration>,
    },

    /// Model-level failure; `available: Some(false)` means the model is gone
    Model { available: Option<bool> },

    /// Tool invocation failure
    Tool { failure: ToolFailure },

    /// Tool exceeded its deadline
    ToolTimeout { timeout_ms: u64, elapsed_ms: u64 },

    /// Session store failure
    Session {
        operation: SessionOperation,
        failure: SessionFailure,
    },

    /// Resource acquire/release/pool failure
    Resource {
        operation: ResourceOperation,
        failure: ResourceFailure,
    },

    /// Invalid configuration or caller input
    Config,
}

impl ErrorKind {
    /// Short, stable name of the kind
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Llm { .. } => "LlmError",
            ErrorKind::RateLimit { .. } => "RateLimitError",
            ErrorKind::Model { .. } => "ModelError",
            ErrorKind::Tool { .. } => "ToolError",
            ErrorKind::ToolTimeout { .. } => "ToolTimeoutError",
            ErrorKind::Session { .. } => "SessionError",
            ErrorKind::Resource { .. } => "ResourceError",
            ErrorKind::Config => "ConfigError",
        }
    }

    /// Whether policy permits another attempt after this kind of failure
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorKind::Llm { failure } => match failure {
                LlmFailure::Request | LlmFailure::Timeout | LlmFailure::Stream => true,
                LlmFailure::Status(status) => RETRYABLE_STATUS_CODES.contains(status),
                LlmFailure::CircuitOpen => false,
            },
            ErrorKind::RateLimit { .. } => true,
            ErrorKind::Model { available } => *available != Some(false),
            ErrorKind::Tool { failure } => matches!(failure, ToolFailure::Transient),
            ErrorKind::ToolTimeout { .. } => true,
            ErrorKind::Session { failure, .. } => {
                matches!(failure, SessionFailure::Store | SessionFailure::Timeout)
            }
            ErrorKind::Resource { failure, .. } => !matches!(failure, ResourceFailure::ShutDown),
            ErrorKind::Config => false,
        }
    }

    /// Whether this is a circuit-breaker short-circuit rather than a real attempt
    pub fn is_circuit_open(&self) -> bool {
        matches!(
            self,
            ErrorKind::Llm {
                failure: LlmFailure::CircuitOpen
            } | ErrorKind::Tool {
                failure: ToolFailure::CircuitOpen
            } | ErrorKind::Session {
                failure: SessionFailure::CircuitOpen,
                ..
            }
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An immutable record of one failure
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} [{target}]: {message}")]
pub struct ErrorRecord {
    kind: ErrorKind,
    message: String,
    target: String,
    timestamp: DateTime<Utc>,
    #[source]
    cause: Option<Cause>,
}

/// Shared upstream cause, kept behind an `Arc` so records stay `Clone`
#[derive(Debug, Clone)]
pub struct Cause(Arc<anyhow::Error>);

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Cause {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl ErrorRecord {
    /// Create a record of the given kind
    pub fn new(kind: ErrorKind, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            target: target.into(),
            timestamp: Utc::now(),
            cause: None,
        }
    }

    /// Attach the upstream cause
    pub fn with_cause(mut self, cause: impl Into<anyhow::Error>) -> Self {
        self.cause = Some(Cause(Arc::new(cause.into())));
        self
    }

    pub fn llm(failure: LlmFailure, model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Llm { failure }, model, message)
    }

    pub fn rate_limit(
        target: impl Into<String>,
        retry_after: Option<Duration>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::RateLimit { retry_after }, target, message)
    }

    pub fn model(
        model: impl Into<String>,
        available: Option<bool>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::Model { available }, model, message)
    }

    pub fn tool(failure: ToolFailure, tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Tool { failure }, tool, message)
    }

    /// Create a tool timeout record
    pub fn tool_timeout(tool: impl Into<String>, timeout: Duration, elapsed: Duration) -> Self {
        Self::new(
            ErrorKind::ToolTimeout {
                timeout_ms: timeout.as_millis() as u64,
                elapsed_ms: elapsed.as_millis() as u64,
            },
            tool,
            format!("Tool execution timed out after {:?}", timeout),
        )
    }

    pub fn session(
        operation: SessionOperation,
        failure: SessionFailure,
        session_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::Session { operation, failure }, session_id, message)
    }

    /// Create a version-conflict record for an update
    pub fn version_conflict(session_id: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::session(
            SessionOperation::Update,
            SessionFailure::VersionConflict { expected, actual },
            session_id,
            format!(
                "Expected session version {} but store is at version {}",
                expected, actual
            ),
        )
    }

    pub fn resource(
        operation: ResourceOperation,
        failure: ResourceFailure,
        resource_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::Resource { operation, failure }, resource_type, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, "config", message)
    }

    /// Error kind with its kind-specific fields
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Target identifier (model name, tool name, session id, resource type)
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Upstream cause, if one was attached
    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.cause.as_ref().map(|c| c.0.as_ref())
    }

    /// Whether policy permits another attempt after this failure
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Whether this record is a circuit-breaker short-circuit
    pub fn is_circuit_open(&self) -> bool {
        self.kind.is_circuit_open()
    }

    /// Server-provided retry hint for rate-limit errors
    pub fn retry_after(&self) -> Option<Duration> {
        match self.kind {
            ErrorKind::RateLimit { retry_after } => retry_after,
            _ => None,
        }
    }
}

/// Pure retry predicate over an error record
pub fn is_retryable(error: &ErrorRecord) -> bool {
    error.is_retryable()
}

impl From<figment::Error> for ErrorRecord {
    fn from(err: figment::Error) -> Self {
        ErrorRecord::config(format!("Failed to load configuration: {}", err))
    }
}

impl From<serde_json::Error> for ErrorRecord {
    fn from(err: serde_json::Error) -> Self {
        ErrorRecord::config(format!("Serialization error: {}", err)).with_cause(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_rate_limit_is_retryable() {
        let err = ErrorRecord::rate_limit("gpt", Some(Duration::from_secs(2)), "slow down");
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_model_availability_controls_retry() {
        assert!(ErrorRecord::model("m", None, "overloaded").is_retryable());
        assert!(ErrorRecord::model("m", Some(true), "overloaded").is_retryable());
        assert!(!ErrorRecord::model("m", Some(false), "decommissioned").is_retryable());
    }

    #[test]
    fn test_validation_errors_are_fatal() {
        assert!(!ErrorRecord::config("bad").is_retryable());
        assert!(
            !ErrorRecord::tool(ToolFailure::InvalidArguments, "search", "missing query")
                .is_retryable()
        );
        assert!(ErrorRecord::tool(ToolFailure::Transient, "search", "reset").is_retryable());
    }

    #[test]
    fn test_llm_status_codes() {
        assert!(ErrorRecord::llm(LlmFailure::Status(503), "m", "unavailable").is_retryable());
        assert!(ErrorRecord::llm(LlmFailure::Status(429), "m", "busy").is_retryable());
        assert!(!ErrorRecord::llm(LlmFailure::Status(400), "m", "bad request").is_retryable());
        assert!(!ErrorRecord::llm(LlmFailure::Status(401), "m", "unauthorized").is_retryable());
        assert!(!ErrorRecord::llm(LlmFailure::CircuitOpen, "m", "open").is_retryable());
    }

    #[test]
    fn test_version_conflict() {
        let err = ErrorRecord::version_conflict("s1", 0, 1);
        assert!(!err.is_retryable());
        assert_eq!(
            err.kind(),
            &ErrorKind::Session {
                operation: SessionOperation::Update,
                failure: SessionFailure::VersionConflict {
                    expected: 0,
                    actual: 1
                },
            }
        );
    }

    #[test]
    fn test_circuit_open_detection() {
        assert!(ErrorRecord::tool(ToolFailure::CircuitOpen, "t", "open").is_circuit_open());
        assert!(ErrorRecord::llm(LlmFailure::CircuitOpen, "m", "open").is_circuit_open());
        assert!(!ErrorRecord::tool(ToolFailure::Execution, "t", "boom").is_circuit_open());
    }

    #[test]
    fn test_cause_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = ErrorRecord::llm(LlmFailure::Request, "m", "request failed").with_cause(io);

        let cloned = err.clone();
        assert!(cloned.cause().is_some());
        assert!(cloned.source().unwrap().to_string().contains("reset by peer"));
        assert_eq!(cloned.to_string(), "LlmError [m]: request failed");
    }

    #[test]
    fn test_kind_serialization() {
        let kind = ErrorKind::Resource {
            operation: ResourceOperation::Acquire,
            failure: ResourceFailure::Exhausted,
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["kind"], "resource");
        assert_eq!(json["operation"], "acquire");
        assert_eq!(json["failure"], "exhausted");
    }
}
