//! Tool call approval types shared across the agent runtime and its responders.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-tool trust level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutonomyLevel {
    /// Execute without asking.
    Auto,
    /// Ask a human before executing.
    Ask,
    /// Never execute.
    Deny,
}

impl std::fmt::Display for AutonomyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AutonomyLevel::Auto => write!(f, "auto"),
            AutonomyLevel::Ask => write!(f, "ask"),
            AutonomyLevel::Deny => write!(f, "deny"),
        }
    }
}

impl std::str::FromStr for AutonomyLevel {
    type Err = crate::error::ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(AutonomyLevel::Auto),
            "ask" => Ok(AutonomyLevel::Ask),
            "deny" => Ok(AutonomyLevel::Deny),
            other => Err(crate::error::ProtoError::InvalidAutonomyLevel(
                other.to_string(),
            )),
        }
    }
}

/// User's decision on a tool call approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalResult {
    /// Approve this single tool call.
    Approved,
    /// Reject this tool call.
    Denied,
    /// Approve and stop asking for this tool.
    AlwaysAllow,
}

impl ApprovalResult {
    /// Whether the tool call may run.
    pub fn permits(self) -> bool {
        matches!(self, ApprovalResult::Approved | ApprovalResult::AlwaysAllow)
    }
}

impl std::str::FromStr for ApprovalResult {
    type Err = crate::error::ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "approved" | "approve" | "yes" | "y" => Ok(ApprovalResult::Approved),
            "denied" | "deny" | "no" | "n" => Ok(ApprovalResult::Denied),
            "always_allow" | "always" | "a" => Ok(ApprovalResult::AlwaysAllow),
            other => Err(crate::error::ProtoError::InvalidApprovalResult(
                other.to_string(),
            )),
        }
    }
}

/// A request for user approval before executing a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Unique request identifier, used by responders.
    pub id: String,
    /// Name of the tool to be executed.
    pub tool_name: String,
    /// JSON arguments for the tool call.
    pub parameters: serde_json::Value,
    /// Human-readable summary of what the call will do.
    pub description: String,
    /// When the request was created.
    pub created_at: DateTime<Utc>,
}

impl ApprovalRequest {
    /// Creates a request with a fresh identifier.
    pub fn new(
        tool_name: impl Into<String>,
        parameters: serde_json::Value,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            parameters,
            description: description.into(),
            created_at: Utc::now(),
        }
    }
}

/// Handler for tool call approval requests.
///
/// The agent runtime calls [`request_approval`](Self::request_approval) for
/// every tool call whose autonomy level is `Ask`.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    /// Request approval for a tool call.
    ///
    /// Returns the decision. Implementations may suspend for as long as a
    /// human needs to answer.
    async fn request_approval(&self, req: ApprovalRequest) -> ApprovalResult;
}

/// Handler that approves every tool call without asking.
///
/// Used for non-interactive runs and tests.
pub struct AutoApproveHandler;

#[async_trait]
impl ApprovalHandler for AutoApproveHandler {
    async fn request_approval(&self, _req: ApprovalRequest) -> ApprovalResult {
        ApprovalResult::Approved
    }
}

/// Handler that rejects every tool call needing approval.
///
/// Used by background invocations with nobody around to answer.
pub struct DenyAllHandler;

#[async_trait]
impl ApprovalHandler for DenyAllHandler {
    async fn request_approval(&self, _req: ApprovalRequest) -> ApprovalResult {
        ApprovalResult::Denied
    }
}
