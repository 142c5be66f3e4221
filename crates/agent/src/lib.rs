//! Agent orchestration: providers, approval, policy, memory, and the tool loop.

pub mod anthropic;
pub mod approval;
pub mod llm;
pub mod memory;
pub mod openrouter;
pub mod policy;
pub mod runtime;
pub mod schema;
mod sse;
pub mod tool_registry;

/// Anthropic Messages API provider.
pub use anthropic::AnthropicProvider;
/// Human-in-the-loop approval rendezvous.
pub use approval::ApprovalRendezvous;
/// Completion request/response models and provider interfaces.
pub use llm::{
    CompletionRequest, CompletionResponse, EventStream, LlmProvider, OpenAiProvider, StopReason,
    StreamEvent, Usage, collect_stream,
};
/// Conversation stores.
pub use memory::{ConversationStore, InMemoryStore, SqliteMemory};
/// OpenRouter provider.
pub use openrouter::OpenRouterProvider;
/// Per-tool autonomy levels.
pub use policy::AutonomyPolicy;
/// Main runtime orchestration loop.
pub use runtime::{AgentRuntime, FailureReason, RuntimeConfig, TurnOutcome, TurnStatus};
/// Runtime tool registry.
pub use tool_registry::ToolRegistry;
