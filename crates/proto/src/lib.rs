//! Shared protocol types for the agent runtime, providers, and tools.
//!
//! This crate defines serializable message/tool/approval structures and
//! strongly-typed error enums shared across the workspace.

pub mod approval;
pub mod error;
pub mod event;
pub mod message;
pub mod tool;

/// Re-export of approval request/decision types and the handler seam.
pub use approval::{
    ApprovalHandler, ApprovalRequest, ApprovalResult, AutoApproveHandler, AutonomyLevel,
    DenyAllHandler,
};
/// Re-export of all protocol error types.
pub use error::*;
/// Re-export of agent loop events.
pub use event::{AgentEvent, LoopState};
/// Re-export of conversation/message types.
pub use message::{ContentBlock, ConversationId, Message, Role};
/// Re-export of tool schema and result types.
pub use tool::{ParameterProperty, ToolApiDefinition, ToolParameters, ToolResult};

/// Returns `true` when the key looks like an Anthropic OAuth access token
/// (`sk-ant-oat*`) rather than a permanent API key (`sk-ant-api*`).
///
/// When this returns `true`, callers should use `Authorization: Bearer`
/// instead of `x-api-key` for Anthropic API requests.
pub fn is_anthropic_oauth_token(key: &str) -> bool {
    key.starts_with("sk-ant-oat")
}
