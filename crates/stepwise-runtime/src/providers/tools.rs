//! Tool execution service and an in-process tool registry.
//!
//! Tools register themselves by name. The registry implements
//! [`ToolService`], so the engine sees the same interface whether tools run
//! in-process or behind a remote protocol client.
//!
//! ## Usage
//!
//! ```ignore
//! let mut registry = ToolRegistry::new();
//! registry.register(Arc::new(FnTool::new("echo", "Echo the input", |args| async move {
//!     Ok(args["text"].to_string())
//! })));
//!
//! let output = registry.execute("echo", &arguments).await?;
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors from tool execution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Unknown tool: '{name}'. Available: {available:?}")]
    NotFound { name: String, available: Vec<String> },

    #[error("Invalid arguments for tool '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("Tool '{tool}' failed: {message}")]
    Failed { tool: String, message: String },

    #[error("Tool '{tool}' timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },
}

impl ToolError {
    pub fn failed(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Whether another attempt may succeed. Unknown tools and rejected
    /// arguments fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Timeout { .. })
    }
}

/// Description of a tool offered to the planning model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescription {
    pub name: String,
    pub description: String,

    /// JSON Schema of the arguments object, `null` when unspecified
    #[serde(default)]
    pub parameters: Value,
}

impl ToolDescription {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Value::Null,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Tool execution backend used by the engine.
#[async_trait]
pub trait ToolService: Send + Sync {
    /// Execute a tool by name.
    async fn execute(&self, name: &str, arguments: &Map<String, Value>) -> Result<String, ToolError>;

    /// Tools available for planning, in a stable order.
    fn describe_tools(&self) -> Vec<ToolDescription>;
}

/// A single tool that can be registered in a [`ToolRegistry`].
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name and description; the name is the registry key.
    fn description(&self) -> ToolDescription;

    async fn call(&self, arguments: &Map<String, Value>) -> Result<String, ToolError>;
}

type Handler = Box<
    dyn Fn(Map<String, Value>) -> BoxFuture<'static, Result<String, ToolError>> + Send + Sync,
>;

/// A tool backed by an async closure.
pub struct FnTool {
    description: ToolDescription,
    handler: Handler,
}

impl FnTool {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
    {
        Self {
            description: ToolDescription::new(name, description),
            handler: Box::new(move |arguments| handler(arguments).boxed()),
        }
    }

    /// Attach a JSON Schema describing the arguments.
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.description.parameters = parameters;
        self
    }
}

#[async_trait]
impl Tool for FnTool {
    fn description(&self) -> ToolDescription {
        self.description.clone()
    }

    async fn call(&self, arguments: &Map<String, Value>) -> Result<String, ToolError> {
        (self.handler)(arguments.clone()).await
    }
}

/// Registry of tools keyed by name.
///
/// Backed by a `BTreeMap` so tool descriptions are always listed in the
/// same order.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.
    ///
    /// If a tool with the same name already exists, it will be replaced.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.description().name;
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::debug!(tool = %name, "Replaced registered tool");
        }
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    /// List registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Check if a tool is registered.
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl ToolService for ToolRegistry {
    async fn execute(&self, name: &str, arguments: &Map<String, Value>) -> Result<String, ToolError> {
        let tool = self.tools.get(name).ok_or_else(|| ToolError::NotFound {
            name: name.to_string(),
            available: self.names().into_iter().map(String::from).collect(),
        })?;

        tracing::debug!(tool = %name, "Executing tool");
        tool.call(arguments).await
    }

    fn describe_tools(&self) -> Vec<ToolDescription> {
        self.tools.values().map(|t| t.description()).collect()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upper() -> Arc<dyn Tool> {
        Arc::new(FnTool::new("upper", "Uppercase text", |args| async move {
            args.get("text")
                .and_then(Value::as_str)
                .map(str::to_uppercase)
                .ok_or_else(|| ToolError::InvalidArguments {
                    tool: "upper".into(),
                    message: "missing 'text'".into(),
                })
        }))
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_registry_executes_registered_tool() {
        let registry = ToolRegistry::new().with_tool(upper());

        let output = registry.execute("upper", &args(json!({"text": "abc"}))).await;
        assert_eq!(output, Ok("ABC".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_tool_lists_available() {
        let registry = ToolRegistry::new().with_tool(upper());

        match registry.execute("lower", &Map::new()).await {
            Err(ToolError::NotFound { name, available }) => {
                assert_eq!(name, "lower");
                assert_eq!(available, vec!["upper".to_string()]);
            }
            other => panic!("Expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_arguments_not_retryable() {
        let registry = ToolRegistry::new().with_tool(upper());
        let err = registry.execute("upper", &Map::new()).await.unwrap_err();

        assert!(matches!(err, ToolError::InvalidArguments { .. }));
        assert!(!err.is_retryable());
        assert!(ToolError::failed("upper", "503").is_retryable());
    }

    #[test]
    fn test_descriptions_sorted_by_name() {
        let noop = |name: &'static str| -> Arc<dyn Tool> {
            Arc::new(FnTool::new(name, "noop", |_| async { Ok(String::new()) }))
        };
        let mut registry = ToolRegistry::new();
        registry.register(noop("zeta"));
        registry.register(noop("alpha"));
        registry.register(noop("alpha"));

        let names: Vec<_> = registry.describe_tools().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_parameters_schema_attached() {
        let tool = FnTool::new("upper", "Uppercase text", |_| async { Ok(String::new()) })
            .with_parameters(json!({"type": "object", "required": ["text"]}));

        assert_eq!(tool.description().parameters["required"][0], "text");
    }
}
