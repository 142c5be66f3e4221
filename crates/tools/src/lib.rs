//! Tool trait and built-in tool implementations.
//!
//! Device capabilities (messaging, calendar, camera, ...) live outside this
//! workspace and plug in through [`Tool`]. The built-ins here are small
//! general-purpose tools used by the `pilot` CLI.

pub mod clock;
pub mod shell;

pub use clock::ClockTool;
pub use shell::ShellTool;

use async_trait::async_trait;
use proto::{ToolApiDefinition, ToolParameters, ToolResult};

/// Trait that all tools must implement
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique, dot-namespaced tool name exposed to the LLM.
    fn name(&self) -> &str;
    /// Human-readable description for tool selection.
    fn description(&self) -> &str;
    /// Whether a call needs human approval when the autonomy level is `Ask`.
    fn requires_approval(&self) -> bool;
    /// Declared parameters.
    fn parameters(&self) -> ToolParameters;
    /// Executes the tool. Failures are reported as [`ToolResult::Error`].
    async fn execute(&self, input: serde_json::Value) -> ToolResult;

    /// One-line summary of a call, shown to whoever approves it.
    fn describe_call(&self, input: &serde_json::Value) -> String {
        format!("{} {}", self.name(), input)
    }

    /// Vendor-neutral declaration of this tool.
    fn definition(&self) -> ToolApiDefinition {
        ToolApiDefinition::new(self.name(), self.description(), self.parameters())
    }
}
