//! Tool contract, argument validation, and registry
//!
//! Tools are looked up by name in a [`ToolRegistry`] and invoked through the
//! [`ToolExecutor`](crate::executor::ToolExecutor), which validates arguments
//! before any call is made.

mod registry;
mod tool;
mod validation;

pub use registry::{ToolRegistry, ToolSummary};
pub use tool::{BoxedTool, HandlerTool, Tool, ToolContext, ToolHandler, ToolMetadata, ToolSchema};
pub use validation::{ValidationError, invalid_arguments, validate_args};
