//! Tool registry used by the runtime to list and execute tools.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::RwLock;
use proto::{ToolApiDefinition, ToolError, ToolResult};
use tools::Tool;
use tracing::{debug, error};

/// Registry of available tools, in registration order.
pub struct ToolRegistry {
    tools: RwLock<Vec<Arc<dyn Tool>>>,
}

impl ToolRegistry {
    /// Creates an empty tool registry.
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(Vec::new()),
        }
    }

    /// Registers a tool. A tool with the same name is replaced in place.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let mut tools = self.tools.write();
        match tools.iter().position(|t| t.name() == name) {
            Some(pos) => {
                debug!("Replacing tool: {name}");
                tools[pos] = tool;
            }
            None => {
                debug!("Registering tool: {name}");
                tools.push(tool);
            }
        }
    }

    pub fn register_all(&self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) {
        for tool in tools {
            self.register(tool);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().iter().find(|t| t.name() == name).cloned()
    }

    /// Snapshot of all registered tools.
    pub fn all(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.read().clone()
    }

    /// Tool definitions for the LLM, in registration order.
    pub fn to_api_schema(&self) -> Vec<ToolApiDefinition> {
        self.tools.read().iter().map(|t| t.definition()).collect()
    }

    /// Returns the list of registered tool names.
    pub fn tool_names(&self) -> Vec<String> {
        self.tools
            .read()
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// Execute a tool call by name. Unknown tools and panics become error results.
    pub async fn execute(&self, name: &str, input: serde_json::Value) -> ToolResult {
        match self.get(name) {
            Some(tool) => run_tool(tool.as_ref(), input).await,
            None => ToolError::NotFound(name.to_string()).into(),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a tool, converting a panic inside its future into an error result.
pub async fn run_tool(tool: &dyn Tool, input: serde_json::Value) -> ToolResult {
    debug!("Executing tool: {}", tool.name());
    match AssertUnwindSafe(tool.execute(input)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(tool = %tool.name(), %message, "Tool panicked");
            ToolError::ExecutionFailed(format!("tool panicked: {message}")).into()
        }
    }
}
