//! Agent loop: drives a conversation through provider calls and tool rounds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::RwLock;
use proto::{
    AgentEvent, ApprovalHandler, ApprovalRequest, ApprovalResult, AutonomyLevel, ContentBlock,
    ConversationId, DatabaseError, Error, LlmError, LoopState, Message, Role, ToolError,
    ToolResult,
};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::{
    llm::{
        CompletionRequest, CompletionResponse, DEFAULT_MAX_TOKENS, LlmProvider, StopReason, Usage,
        collect_stream,
    },
    memory::ConversationStore,
    policy::AutonomyPolicy,
    tool_registry::{ToolRegistry, run_tool},
};

const DEFAULT_IDENTITY: &str = r#"You are pilot, an assistant running on the user's device.
You can act on the device through the available tools.
Be helpful, concise, and careful. Never claim a tool succeeded unless its result says so."#;

/// Tunables for [`AgentRuntime`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Identity section at the top of every system prompt.
    pub identity: String,
    /// Maximum tool rounds per submission; `0` means unlimited.
    pub max_iterations: usize,
    pub max_tokens: u32,
    /// Messages loaded from the store per submission; `0` loads everything.
    pub history_limit: usize,
    /// Use the provider's streaming endpoint.
    pub streaming: bool,
    /// How long an `Ask` call waits for a human before it counts as denied.
    pub approval_timeout: Option<Duration>,
    /// Character budget for a single tool result sent to the model.
    pub max_tool_output_chars: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            identity: DEFAULT_IDENTITY.to_string(),
            max_iterations: 10,
            max_tokens: DEFAULT_MAX_TOKENS,
            history_limit: 40,
            streaming: true,
            approval_timeout: None,
            max_tool_output_chars: 16_000,
        }
    }
}

/// Why a submission stopped without finishing.
#[derive(Debug, thiserror::Error)]
pub enum FailureReason {
    #[error("iteration limit reached after {rounds} tool rounds")]
    IterationLimit { rounds: usize },
    #[error("provider error: {0}")]
    Provider(LlmError),
    #[error("storage error: {0}")]
    Storage(DatabaseError),
}

impl From<FailureReason> for Error {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::IterationLimit { rounds } => Error::IterationLimit(rounds),
            FailureReason::Provider(err) => Error::Llm(err),
            FailureReason::Storage(err) => Error::Database(err),
        }
    }
}

#[derive(Debug)]
pub enum TurnStatus {
    Done { stop_reason: StopReason },
    Failed(FailureReason),
}

/// Result of one submission. The transcript is kept in the store either way.
#[derive(Debug)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    /// Text of the most recent assistant response that carried any.
    pub text: String,
    /// Token usage summed over every provider call of the submission.
    pub usage: Usage,
    /// Completed tool rounds.
    pub rounds: usize,
}

impl TurnOutcome {
    fn new() -> Self {
        Self {
            status: TurnStatus::Done {
                stop_reason: StopReason::EndTurn,
            },
            text: String::new(),
            usage: Usage::default(),
            rounds: 0,
        }
    }

    fn fail(mut self, reason: FailureReason) -> Self {
        self.status = TurnStatus::Failed(reason);
        self
    }

    pub fn is_done(&self) -> bool {
        matches!(self.status, TurnStatus::Done { .. })
    }

    /// Converts a failed outcome into the workspace error type.
    pub fn into_result(self) -> Result<TurnOutcome, Error> {
        let TurnOutcome {
            status,
            text,
            usage,
            rounds,
        } = self;
        match status {
            TurnStatus::Failed(reason) => Err(reason.into()),
            done => Ok(TurnOutcome {
                status: done,
                text,
                usage,
                rounds,
            }),
        }
    }
}

/// The agent runtime: owns providers and collaborators and runs the tool loop.
pub struct AgentRuntime {
    providers: RwLock<HashMap<String, Arc<dyn LlmProvider>>>,
    active_provider: RwLock<String>,
    tools: Arc<ToolRegistry>,
    store: Arc<dyn ConversationStore>,
    policy: Arc<AutonomyPolicy>,
    approval: RwLock<Arc<dyn ApprovalHandler>>,
    config: RuntimeConfig,
    /// One running submission per conversation.
    conversation_locks: DashMap<ConversationId, Arc<Mutex<()>>>,
}

impl AgentRuntime {
    /// Creates a runtime whose active provider is `provider`.
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn ConversationStore>,
        policy: Arc<AutonomyPolicy>,
        approval: Arc<dyn ApprovalHandler>,
        config: RuntimeConfig,
    ) -> Self {
        let name = provider.name().to_string();
        let providers = HashMap::from([(name.clone(), provider)]);
        Self {
            providers: RwLock::new(providers),
            active_provider: RwLock::new(name),
            tools,
            store,
            policy,
            approval: RwLock::new(approval),
            config,
            conversation_locks: DashMap::new(),
        }
    }

    /// Replaces the approval handler for calls that start afterwards.
    pub fn set_approval_handler(&self, handler: Arc<dyn ApprovalHandler>) {
        *self.approval.write() = handler;
    }

    /// Registers an additional provider under its own name.
    pub fn register_provider(&self, provider: Arc<dyn LlmProvider>) {
        let name = provider.name().to_string();
        debug!(provider = %name, "Registering provider");
        self.providers.write().insert(name, provider);
    }

    /// Switches the active provider to a previously registered one.
    pub fn switch_provider(&self, name: &str) -> Result<(), LlmError> {
        if !self.providers.read().contains_key(name) {
            return Err(LlmError::Config(format!("unknown provider: {name}")));
        }
        info!(provider = %name, "Switching active provider");
        *self.active_provider.write() = name.to_string();
        Ok(())
    }

    pub fn active_provider_name(&self) -> String {
        self.active_provider.read().clone()
    }

    /// Names of all registered providers, sorted.
    pub fn registered_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn policy(&self) -> &Arc<AutonomyPolicy> {
        &self.policy
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn active_provider(&self) -> Result<Arc<dyn LlmProvider>, LlmError> {
        let name = self.active_provider.read().clone();
        self.providers
            .read()
            .get(&name)
            .cloned()
            .ok_or_else(|| LlmError::Config(format!("unknown provider: {name}")))
    }

    /// Runs a scheduled prompt. A transient provider failure retries the
    /// whole submission once; anything else is reported as an error.
    pub async fn run_scheduled(
        &self,
        conversation: &ConversationId,
        prompt: &str,
    ) -> Result<TurnOutcome, Error> {
        let outcome = self.submit_message(conversation, prompt, None).await;
        let transient = matches!(
            &outcome.status,
            TurnStatus::Failed(FailureReason::Provider(err)) if err.is_transient()
        );
        if !transient {
            return outcome.into_result();
        }
        warn!(conversation = %conversation, "Scheduled run hit a transient failure; retrying once");
        self.submit_message(conversation, prompt, None)
            .await
            .into_result()
    }

    /// Appends a user message and drives the loop until the model finishes,
    /// the provider fails, or the iteration cap is hit.
    ///
    /// Progress is reported on `events` when given. Submissions for the same
    /// conversation are serialized; different conversations run concurrently.
    pub async fn submit_message(
        &self,
        conversation: &ConversationId,
        text: &str,
        events: Option<mpsc::Sender<AgentEvent>>,
    ) -> TurnOutcome {
        let lock = Arc::clone(
            self.conversation_locks
                .entry(conversation.clone())
                .or_default()
                .value(),
        );
        let outcome = {
            let _serial = lock.lock().await;
            let events = events.as_ref();
            let outcome = self.run_loop(conversation, text, events).await;
            let state = if outcome.is_done() {
                LoopState::Done
            } else {
                LoopState::Failed
            };
            emit(
                events,
                AgentEvent::StateChanged {
                    state,
                    turn: outcome.rounds,
                },
            )
            .await;
            outcome
        };
        drop(lock);
        // Only the map still holds the lock when nobody else is queued.
        self.conversation_locks
            .remove_if(conversation, |_, lock| Arc::strong_count(lock) == 1);
        outcome
    }

    async fn run_loop(
        &self,
        conversation: &ConversationId,
        text: &str,
        events: Option<&mpsc::Sender<AgentEvent>>,
    ) -> TurnOutcome {
        let outcome = TurnOutcome::new();

        let user = Message::user(text);
        if let Err(e) = self.store.append(conversation, &user).await {
            return outcome.fail(FailureReason::Storage(e));
        }
        let history = match self
            .store
            .recent(conversation, self.config.history_limit)
            .await
        {
            Ok(history) => history,
            Err(e) => return outcome.fail(FailureReason::Storage(e)),
        };
        let mut messages = close_dangling_tool_calls(trim_history(history));

        let provider = match self.active_provider() {
            Ok(provider) => provider,
            Err(e) => return outcome.fail(FailureReason::Provider(e)),
        };
        let system_prompt = self.build_system_prompt().await;
        let catalog = self.tools.to_api_schema();

        self.drive(conversation, provider, system_prompt, catalog, &mut messages, outcome, events)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        conversation: &ConversationId,
        provider: Arc<dyn LlmProvider>,
        system_prompt: String,
        catalog: Vec<proto::ToolApiDefinition>,
        messages: &mut Vec<Message>,
        mut outcome: TurnOutcome,
        events: Option<&mpsc::Sender<AgentEvent>>,
    ) -> TurnOutcome {
        let cap = self.config.max_iterations;
        let mut turn = 0;
        loop {
            if cap > 0 && outcome.rounds >= cap {
                warn!(
                    conversation = %conversation,
                    rounds = outcome.rounds,
                    "Iteration limit reached"
                );
                let rounds = outcome.rounds;
                return outcome.fail(FailureReason::IterationLimit { rounds });
            }

            turn += 1;
            emit(
                events,
                AgentEvent::StateChanged {
                    state: LoopState::AwaitingModel,
                    turn,
                },
            )
            .await;
            let req = CompletionRequest::new(system_prompt.clone(), messages.clone())
                .with_tools(catalog.clone())
                .with_max_tokens(self.config.max_tokens);

            debug!(conversation = %conversation, turn, provider = %provider.name(), "Provider call");
            let t0 = std::time::Instant::now();
            let response = match self.call_provider(provider.as_ref(), req, events).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(conversation = %conversation, error = %e, "Provider call failed");
                    return outcome.fail(FailureReason::Provider(e));
                }
            };
            debug!(
                elapsed_ms = %t0.elapsed().as_millis(),
                stop_reason = ?response.stop_reason,
                "Provider responded"
            );
            emit(
                events,
                AgentEvent::StateChanged {
                    state: LoopState::ModelResponded,
                    turn,
                },
            )
            .await;

            if let Some(usage) = &response.usage {
                outcome.usage.add(usage);
            }
            let text = response.text();
            if !text.is_empty() {
                outcome.text = text;
            }

            if !response.content.is_empty() {
                let assistant = Message::assistant(response.content.clone());
                if let Err(e) = self.store.append(conversation, &assistant).await {
                    return outcome.fail(FailureReason::Storage(e));
                }
                messages.push(assistant);
            }

            // A truncated response may hold a cut-off tool call; it is left
            // unanswered and closed on the next submission.
            if response.stop_reason == StopReason::MaxTokens || !response.has_tool_use() {
                if response.stop_reason == StopReason::Error {
                    return outcome.fail(FailureReason::Provider(LlmError::Rejected(
                        "model stopped with an error".to_string(),
                    )));
                }
                info!(
                    conversation = %conversation,
                    rounds = outcome.rounds,
                    input_tokens = outcome.usage.input_tokens,
                    output_tokens = outcome.usage.output_tokens,
                    "Turn finished"
                );
                outcome.status = TurnStatus::Done {
                    stop_reason: response.stop_reason,
                };
                return outcome;
            }

            emit(
                events,
                AgentEvent::StateChanged {
                    state: LoopState::DispatchingTools,
                    turn,
                },
            )
            .await;
            let results = self.dispatch_tools(&response, events).await;
            let results = Message::tool_results(results);
            if let Err(e) = self.store.append(conversation, &results).await {
                return outcome.fail(FailureReason::Storage(e));
            }
            messages.push(results);
            outcome.rounds += 1;
        }
    }

    async fn call_provider(
        &self,
        provider: &dyn LlmProvider,
        req: CompletionRequest,
        events: Option<&mpsc::Sender<AgentEvent>>,
    ) -> Result<CompletionResponse, LlmError> {
        if self.config.streaming {
            let stream = provider.stream(req).await;
            collect_stream(stream, move |text| emit(events, AgentEvent::TextDelta(text))).await
        } else {
            let response = provider.complete(req).await?;
            let text = response.text();
            if !text.is_empty() {
                emit(events, AgentEvent::TextDelta(text)).await;
            }
            Ok(response)
        }
    }

    /// Runs every ToolUse of a response concurrently. Results come back in
    /// ToolUse order, one per call.
    async fn dispatch_tools(
        &self,
        response: &CompletionResponse,
        events: Option<&mpsc::Sender<AgentEvent>>,
    ) -> Vec<ContentBlock> {
        let calls = response.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some((id, name, input)),
            _ => None,
        });
        join_all(calls.map(|(id, name, input)| async move {
            emit(
                events,
                AgentEvent::ToolCallStarted {
                    call_id: id.clone(),
                    tool_name: name.clone(),
                    input: input.clone(),
                },
            )
            .await;
            let result = self.gate_and_run(name, input).await;
            let output = truncate_tool_output(&result.render(), self.config.max_tool_output_chars);
            emit(
                events,
                AgentEvent::ToolCallFinished {
                    call_id: id.clone(),
                    tool_name: name.clone(),
                    output: output.clone(),
                    is_error: result.is_error(),
                },
            )
            .await;
            ContentBlock::tool_result(id.clone(), output, result.is_error())
        }))
        .await
    }

    /// Applies the autonomy policy to one call and runs the tool if allowed.
    async fn gate_and_run(&self, name: &str, input: &Value) -> ToolResult {
        let Some(tool) = self.tools.get(name) else {
            warn!(tool = %name, "Model requested an unknown tool");
            return ToolError::NotFound(name.to_string()).into();
        };

        match self.policy.get_policy(name) {
            AutonomyLevel::Deny => {
                info!(tool = %name, "Tool call blocked by policy");
                ToolResult::error(format!("Tool '{name}' is denied by the autonomy policy"))
            }
            AutonomyLevel::Auto => run_tool(tool.as_ref(), input.clone()).await,
            AutonomyLevel::Ask if !tool.requires_approval() => {
                run_tool(tool.as_ref(), input.clone()).await
            }
            AutonomyLevel::Ask => {
                let req = ApprovalRequest::new(name, input.clone(), tool.describe_call(input));
                let decision = self.await_approval(req).await;
                if decision == ApprovalResult::AlwaysAllow {
                    self.policy.set_policy(name, AutonomyLevel::Auto);
                }
                if decision.permits() {
                    run_tool(tool.as_ref(), input.clone()).await
                } else {
                    info!(tool = %name, "Tool call denied by user");
                    ToolResult::error(format!("User denied the call to '{name}'"))
                }
            }
        }
    }

    async fn await_approval(&self, req: ApprovalRequest) -> ApprovalResult {
        let handler = Arc::clone(&*self.approval.read());
        let Some(limit) = self.config.approval_timeout else {
            return handler.request_approval(req).await;
        };
        let tool = req.tool_name.clone();
        match tokio::time::timeout(limit, handler.request_approval(req)).await {
            Ok(decision) => decision,
            Err(_) => {
                warn!(tool = %tool, timeout_secs = limit.as_secs(), "Approval timed out");
                ApprovalResult::Denied
            }
        }
    }

    /// Identity, then known facts, then the tool catalog.
    async fn build_system_prompt(&self) -> String {
        let mut prompt = self.config.identity.clone();
        match self.store.fact_context().await {
            Ok(facts) if !facts.is_empty() => {
                prompt.push_str("\n\n");
                prompt.push_str(&facts);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not load fact context"),
        }
        let tools = self.tools.all();
        if !tools.is_empty() {
            prompt.push_str("\n\nAvailable tools:");
            for tool in tools {
                prompt.push_str(&format!("\n- {}: {}", tool.name(), tool.description()));
            }
        }
        prompt
    }
}

/// Waits for room in the caller's channel so no delta is lost. A closed
/// receiver only means nobody is listening anymore.
async fn emit(events: Option<&mpsc::Sender<AgentEvent>>, event: AgentEvent) {
    let Some(tx) = events else { return };
    if tx.send(event).await.is_err() {
        debug!("Event receiver closed");
    }
}

/// Drops leading messages until the window starts at a user text message,
/// so no orphaned tool result or assistant turn opens the history.
fn trim_history(history: Vec<Message>) -> Vec<Message> {
    let start = history
        .iter()
        .position(|m| m.role == Role::User && !m.has_tool_results())
        .unwrap_or(history.len());
    if start > 0 {
        debug!(dropped = start, "Trimmed history to a user boundary");
    }
    history.into_iter().skip(start).collect()
}

/// Inserts error results for tool calls that never got one, e.g. after a
/// submission was cancelled mid-dispatch.
fn close_dangling_tool_calls(history: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(history.len());
    let mut iter = history.into_iter().peekable();
    while let Some(message) = iter.next() {
        let call_ids: Vec<String> = message
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect();
        let answered = iter.peek().is_some_and(|next| next.has_tool_results());
        out.push(message);
        if !call_ids.is_empty() && !answered {
            warn!(calls = call_ids.len(), "Closing tool calls that have no result");
            out.push(Message::tool_results(
                call_ids
                    .into_iter()
                    .map(|id| ContentBlock::tool_result(id, "Tool call was interrupted", true))
                    .collect(),
            ));
        }
    }
    out
}

/// Truncates a tool result to at most `max_chars` characters, noting how
/// many were cut.
fn truncate_tool_output(output: &str, max_chars: usize) -> String {
    let total_chars = output.chars().count();
    if total_chars <= max_chars {
        return output.to_string();
    }
    let kept = output.chars().take(max_chars).collect::<String>();
    let cut = total_chars - max_chars;
    format!("{kept}\n...[output truncated: {cut} chars omitted]")
}
