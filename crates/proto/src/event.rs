use serde::{Deserialize, Serialize};

/// States of the agent loop state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// A provider call is in flight.
    AwaitingModel,
    /// The provider answered; the response is being inspected.
    ModelResponded,
    /// Tool calls from the response are being gated and executed.
    DispatchingTools,
    /// The model finished its turn.
    Done,
    /// The submission stopped on an error or the iteration cap.
    Failed,
}

impl LoopState {
    /// Whether the state ends a submission.
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Done | LoopState::Failed)
    }
}

/// Real-time events emitted while a submission runs.
///
/// These events are sent via `tokio::sync::mpsc` from
/// `AgentRuntime::submit_message()` so that consumers (e.g. a chat UI)
/// can display streamed text and live tool-call status.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// The loop moved to a new state; `turn` counts provider calls.
    StateChanged { state: LoopState, turn: usize },
    /// A fragment of assistant text.
    TextDelta(String),
    /// A tool call has been dispatched but has not yet completed.
    ToolCallStarted {
        call_id: String,
        tool_name: String,
        input: serde_json::Value,
    },
    /// A tool call has finished (or was refused).
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
}
