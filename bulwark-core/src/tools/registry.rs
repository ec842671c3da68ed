//! Tool Registry for tool registration and lookup
//!
//! The registry is shared between executors, so registration goes through
//! an internal lock and takes `&self`.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::tool::Tool;
use crate::error::{ErrorRecord, Result, ToolFailure};

/// Summary of a registered tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub version: Option<String>,
}

impl From<&dyn Tool> for ToolSummary {
    fn from(tool: &dyn Tool) -> Self {
        let metadata = tool.metadata();
        Self {
            name: metadata.name.clone(),
            description: metadata.description.clone(),
            tags: metadata.tags.clone(),
            version: metadata.version.clone(),
        }
    }
}

/// Registry of invocable tools, keyed by name
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; a duplicate name is a configuration error
    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        let mut tools = self.tools.write();
        if tools.contains_key(&name) {
            return Err(ErrorRecord::config(format!(
                "Tool '{}' is already registered",
                name
            )));
        }
        tracing::debug!(tool = %name, "Registered tool");
        tools.insert(name, tool);
        Ok(())
    }

    /// Remove a tool, returning it if it was registered
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.write().remove(name)
    }

    /// Look up a tool by name
    pub fn get(&self, name: &str) -> Result<Arc<dyn Tool>> {
        self.tools.read().get(name).cloned().ok_or_else(|| {
            ErrorRecord::tool(
                ToolFailure::NotFound,
                name,
                format!("Tool '{}' not found", name),
            )
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    /// Registered tool names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Summaries of all registered tools, sorted by name
    pub fn list(&self) -> Vec<ToolSummary> {
        let mut summaries: Vec<ToolSummary> = self
            .tools
            .read()
            .values()
            .map(|tool| ToolSummary::from(tool.as_ref()))
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::tools::{HandlerTool, ToolContext, ToolMetadata, ToolSchema};
    use serde_json::Value;

    fn tool(name: &str) -> Arc<dyn Tool> {
        Arc::new(HandlerTool::new(
            ToolMetadata::new(name, format!("{} tool", name)).with_version("1.0"),
            ToolSchema::empty(),
            |_args: Value, _ctx: ToolContext| async { Ok::<_, ErrorRecord>(Value::Null) },
        ))
    }

    #[test]
    fn test_register_and_get() {
        let registry = ToolRegistry::new();
        registry.register(tool("search")).unwrap();
        registry.register(tool("browse")).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("search"));
        assert_eq!(registry.get("search").unwrap().name(), "search");
        assert_eq!(registry.names(), vec!["browse", "search"]);
        assert_eq!(registry.list()[0].version.as_deref(), Some("1.0"));
    }

    #[test]
    fn test_duplicate_registration() {
        let registry = ToolRegistry::new();
        registry.register(tool("search")).unwrap();
        let err = registry.register(tool("search")).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Config);
    }

    #[test]
    fn test_not_found() {
        let registry = ToolRegistry::new();
        let err = match registry.get("missing") {
            Ok(_) => panic!("expected lookup to fail"),
            Err(err) => err,
        };
        assert_eq!(
            err.kind(),
            &ErrorKind::Tool {
                failure: ToolFailure::NotFound
            }
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_unregister() {
        let registry = ToolRegistry::new();
        registry.register(tool("search")).unwrap();
        assert!(registry.unregister("search").is_some());
        assert!(registry.is_empty());
    }
}
