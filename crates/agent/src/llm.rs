//! LLM provider abstraction and OpenAI Chat Completions implementation.

use std::collections::VecDeque;
use std::pin::Pin;

use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionResponseStream, ChatCompletionStreamOptions, ChatCompletionTool,
        ChatCompletionToolType, CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
        CreateChatCompletionStreamResponse, FinishReason, FunctionCall, FunctionObjectArgs,
    },
};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt, stream};
use parking_lot::RwLock;
use proto::{ContentBlock, LlmError, Message, Role, ToolApiDefinition};
use serde_json::Value;
use tracing::{debug, warn};

use crate::schema::{self, ToolNameMap};

/// Output token budget used when the caller does not set one.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Request to the LLM, built fresh for every provider call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// System prompt; empty means none.
    pub system_prompt: String,
    /// Transcript in order.
    pub messages: Vec<Message>,
    /// Tools the model may call.
    pub tools: Vec<ToolApiDefinition>,
    /// Output token budget, always positive.
    pub max_tokens: u32,
}

impl CompletionRequest {
    pub fn new(system_prompt: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            messages,
            tools: Vec::new(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolApiDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Sets the output budget; zero is clamped to one.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens.max(1);
        self
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Error,
}

impl StopReason {
    /// Maps an OpenAI-style `finish_reason` string.
    pub fn from_openai(reason: &str) -> Self {
        match reason {
            "stop" => StopReason::EndTurn,
            "length" => StopReason::MaxTokens,
            "tool_calls" | "function_call" => StopReason::ToolUse,
            _ => StopReason::Error,
        }
    }

    /// Maps an Anthropic `stop_reason` string.
    pub fn from_anthropic(reason: &str) -> Self {
        match reason {
            "end_turn" | "stop_sequence" => StopReason::EndTurn,
            "max_tokens" => StopReason::MaxTokens,
            "tool_use" => StopReason::ToolUse,
            _ => StopReason::Error,
        }
    }

    /// Vendors disagree on whether text-only stops carry tool calls; the
    /// presence of ToolUse blocks wins.
    fn reconcile(self, content: &[ContentBlock]) -> Self {
        let has_tool_use = content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }));
        match self {
            StopReason::EndTurn if has_tool_use => StopReason::ToolUse,
            other => other,
        }
    }
}

/// Token usage reported by the LLM for a single call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    /// Accumulates another usage record into this one.
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }
}

/// Response from the LLM
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Option<Usage>,
}

impl CompletionResponse {
    /// Builds a response, normalizing the stop reason against the content.
    pub fn new(content: Vec<ContentBlock>, stop_reason: StopReason, usage: Option<Usage>) -> Self {
        let stop_reason = stop_reason.reconcile(&content);
        Self {
            content,
            stop_reason,
            usage,
        }
    }

    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Whether the response requests any tool call.
    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }
}

/// Incremental event from a streaming call.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta(String),
    ToolUseStart { id: String, name: String },
    ToolUseInputDelta(String),
    /// Final assembled response; always the last event of a healthy stream.
    Complete(CompletionResponse),
    /// Terminal failure; no events follow.
    Error(LlmError),
}

/// Lazy, single-use event stream returned by [`LlmProvider::stream`].
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// A stream that yields one error and ends.
pub fn error_stream(err: LlmError) -> EventStream {
    Box::pin(stream::iter([StreamEvent::Error(err)]))
}

/// LLM provider trait
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Short identifier such as `anthropic`.
    fn name(&self) -> &str;

    /// Replaces credentials and model; calls already in flight keep the old ones.
    fn configure(&self, api_key: &str, model: &str);

    /// Blocking completion.
    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Streaming completion. Setup failures arrive as a single `Error` event.
    async fn stream(&self, req: CompletionRequest) -> EventStream;
}

/// Credentials and model snapshotted at the start of each call.
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub api_key: String,
    pub model: String,
}

impl ProviderSettings {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// Rejects empty credentials or model before any network call.
    pub fn validate(&self, provider: &str) -> Result<(), LlmError> {
        if self.api_key.trim().is_empty() {
            return Err(LlmError::Config(format!("{provider} API key is empty")));
        }
        if self.model.trim().is_empty() {
            return Err(LlmError::Config(format!("{provider} model is empty")));
        }
        Ok(())
    }
}

#[derive(Debug)]
enum PartialBlock {
    Text(String),
    ToolUse { id: String, name: String, json: String },
}

/// Rebuilds content blocks from stream deltas.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    blocks: Vec<PartialBlock>,
    orphan_delta: bool,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one event; terminal events are ignored.
    pub fn push(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextDelta(text) => match self.blocks.last_mut() {
                Some(PartialBlock::Text(buf)) => buf.push_str(text),
                _ => self.blocks.push(PartialBlock::Text(text.clone())),
            },
            StreamEvent::ToolUseStart { id, name } => self.blocks.push(PartialBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                json: String::new(),
            }),
            StreamEvent::ToolUseInputDelta(fragment) => match self.blocks.last_mut() {
                Some(PartialBlock::ToolUse { json, .. }) => json.push_str(fragment),
                _ => self.orphan_delta = true,
            },
            StreamEvent::Complete(_) | StreamEvent::Error(_) => {}
        }
    }

    pub fn has_content(&self) -> bool {
        !self.blocks.is_empty()
    }

    /// Assembles the final blocks, parsing each tool input.
    pub fn finish(self) -> Result<Vec<ContentBlock>, LlmError> {
        if self.orphan_delta {
            return Err(LlmError::Protocol(
                "tool input delta arrived before any tool_use start".to_string(),
            ));
        }
        self.blocks
            .into_iter()
            .filter_map(|block| match block {
                PartialBlock::Text(text) if text.is_empty() => None,
                PartialBlock::Text(text) => Some(Ok(ContentBlock::text(text))),
                PartialBlock::ToolUse { id, name, json } => {
                    Some(parse_tool_input(&json).map(|input| ContentBlock::tool_use(id, name, input)))
                }
            })
            .collect()
    }
}

/// Parses accumulated tool-call arguments. Empty input is `{}`; anything
/// other than a JSON object is a protocol error.
pub fn parse_tool_input(raw: &str) -> Result<Value, LlmError> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(other) => Err(LlmError::Protocol(format!(
            "tool input is not a JSON object: {other}"
        ))),
        Err(e) => Err(LlmError::Protocol(format!("malformed tool input JSON: {e}"))),
    }
}

/// Drains a stream into a response, forwarding text deltas to `on_text`.
/// Each delta's future is awaited before the next event is read.
///
/// A stream that ends without `Complete` or `Error` is a protocol error.
pub async fn collect_stream<F, Fut>(
    mut events: EventStream,
    mut on_text: F,
) -> Result<CompletionResponse, LlmError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut acc = StreamAccumulator::new();
    while let Some(event) = events.next().await {
        match event {
            StreamEvent::Complete(mut response) => {
                if response.content.is_empty() && acc.has_content() {
                    response.content = acc.finish()?;
                    response.stop_reason = response.stop_reason.reconcile(&response.content);
                }
                return Ok(response);
            }
            StreamEvent::Error(err) => return Err(err),
            other => {
                if let StreamEvent::TextDelta(text) = &other {
                    on_text(text.clone()).await;
                }
                acc.push(&other);
            }
        }
    }
    Err(LlmError::Protocol(
        "stream ended without a completion event".to_string(),
    ))
}

/// OpenAI Chat Completions provider (works with any compatible endpoint).
pub struct OpenAiProvider {
    state: RwLock<OpenAiState>,
    base_url: Option<String>,
}

struct OpenAiState {
    settings: ProviderSettings,
    client: Client<OpenAIConfig>,
}

impl OpenAiProvider {
    /// Creates an OpenAI provider using the default API base URL.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let settings = ProviderSettings::new(api_key, model);
        let client = build_client(&settings.api_key, None);
        Self {
            state: RwLock::new(OpenAiState { settings, client }),
            base_url: None,
        }
    }

    /// Creates an OpenAI provider with a custom API base URL.
    pub fn with_base_url(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into();
        let settings = ProviderSettings::new(api_key, model);
        let client = build_client(&settings.api_key, Some(&base_url));
        Self {
            state: RwLock::new(OpenAiState { settings, client }),
            base_url: Some(base_url),
        }
    }

    fn snapshot(&self) -> Result<(ProviderSettings, Client<OpenAIConfig>), LlmError> {
        let state = self.state.read();
        state.settings.validate("openai")?;
        Ok((state.settings.clone(), state.client.clone()))
    }
}

fn build_client(api_key: &str, base_url: Option<&str>) -> Client<OpenAIConfig> {
    let mut config = OpenAIConfig::new().with_api_key(api_key);
    if let Some(url) = base_url {
        config = config.with_api_base(url);
    }
    Client::with_config(config)
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn configure(&self, api_key: &str, model: &str) {
        let client = build_client(api_key, self.base_url.as_deref());
        let mut state = self.state.write();
        state.settings = ProviderSettings::new(api_key, model);
        state.client = client;
    }

    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (settings, client) = self.snapshot()?;
        let names = ToolNameMap::new(&req.tools)?;
        let request = build_request(&settings.model, &req, &names, false)?;

        debug!(
            model = %settings.model,
            messages = %req.messages.len(),
            tools = %req.tools.len(),
            "Sending request to OpenAI"
        );

        let response = client
            .chat()
            .create(request)
            .await
            .map_err(map_openai_error)?;

        let usage = response.usage.as_ref().map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        });
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Protocol("No choices in response".into()))?;

        let mut content = Vec::new();
        if let Some(text) = choice.message.content
            && !text.is_empty()
        {
            content.push(ContentBlock::text(text));
        }
        for call in choice.message.tool_calls.unwrap_or_default() {
            let input = parse_tool_input(&call.function.arguments)?;
            content.push(ContentBlock::tool_use(
                call.id,
                names.original_name(&call.function.name),
                input,
            ));
        }

        let stop_reason = choice
            .finish_reason
            .map(stop_reason_from_finish)
            .unwrap_or(StopReason::EndTurn);
        Ok(CompletionResponse::new(content, stop_reason, usage))
    }

    async fn stream(&self, req: CompletionRequest) -> EventStream {
        let setup = async {
            let (settings, client) = self.snapshot()?;
            let names = ToolNameMap::new(&req.tools)?;
            let request = build_request(&settings.model, &req, &names, true)?;
            debug!(model = %settings.model, "Opening OpenAI stream");
            let inner = client
                .chat()
                .create_stream(request)
                .await
                .map_err(map_openai_error)?;
            Ok::<_, LlmError>((inner, names))
        };

        match setup.await {
            Ok((inner, names)) => OpenAiStream::new(inner, names).into_events(),
            Err(e) => error_stream(e),
        }
    }
}

fn stop_reason_from_finish(reason: FinishReason) -> StopReason {
    match reason {
        FinishReason::Stop => StopReason::EndTurn,
        FinishReason::Length => StopReason::MaxTokens,
        FinishReason::ToolCalls | FinishReason::FunctionCall => StopReason::ToolUse,
        FinishReason::ContentFilter => StopReason::Error,
        #[allow(unreachable_patterns)]
        _ => StopReason::Error,
    }
}

fn map_openai_error(e: OpenAIError) -> LlmError {
    match e {
        OpenAIError::Reqwest(err) => LlmError::Transport(err.to_string()),
        OpenAIError::ApiError(api) => {
            let lower = api.message.to_lowercase();
            if lower.contains("rate limit") {
                LlmError::RateLimit
            } else {
                LlmError::Rejected(api.message)
            }
        }
        OpenAIError::JSONDeserialize(err) => LlmError::Protocol(err.to_string()),
        OpenAIError::StreamError(msg) => LlmError::Transport(msg),
        other => LlmError::Protocol(other.to_string()),
    }
}

fn build_request(
    model: &str,
    req: &CompletionRequest,
    names: &ToolNameMap,
    streaming: bool,
) -> Result<CreateChatCompletionRequest, LlmError> {
    let messages = convert_messages(&req.system_prompt, &req.messages, names)?;
    let tools: Vec<ChatCompletionTool> = names
        .wire_definitions(&req.tools)
        .iter()
        .map(convert_tool)
        .collect::<Result<_, _>>()?;

    let mut builder = CreateChatCompletionRequestArgs::default();
    builder
        .model(model)
        .messages(messages)
        .max_completion_tokens(req.max_tokens);
    if !tools.is_empty() {
        builder.tools(tools);
    }
    if streaming {
        builder
            .stream(true)
            .stream_options(ChatCompletionStreamOptions {
                include_usage: true,
            });
    }
    builder
        .build()
        .map_err(|e| LlmError::Serialization(e.to_string()))
}

/// Converts the transcript into OpenAI request messages.
///
/// Tool results become `tool` messages placed before any user text of the
/// same turn, since the API expects them directly after the assistant call.
fn convert_messages(
    system_prompt: &str,
    messages: &[Message],
    names: &ToolNameMap,
) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
    let ser = |e: async_openai::error::OpenAIError| LlmError::Serialization(e.to_string());
    let mut out = Vec::with_capacity(messages.len() + 1);

    if !system_prompt.is_empty() {
        out.push(ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system_prompt.to_string())
                .build()
                .map_err(ser)?,
        ));
    }

    for message in messages {
        match message.role {
            Role::User => {
                let mut text = String::new();
                for block in &message.content {
                    match block {
                        ContentBlock::Text { text: t } => text.push_str(t),
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => out.push(ChatCompletionRequestMessage::Tool(
                            ChatCompletionRequestToolMessageArgs::default()
                                .tool_call_id(tool_use_id.clone())
                                .content(tool_result_text(content, *is_error))
                                .build()
                                .map_err(ser)?,
                        )),
                        ContentBlock::ToolUse { .. } => {
                            warn!("Dropping tool_use block found in a user message");
                        }
                    }
                }
                if !text.is_empty() {
                    out.push(ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(text)
                            .build()
                            .map_err(ser)?,
                    ));
                }
            }
            Role::Assistant => {
                let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
                let text = message.text();
                if !text.is_empty() {
                    builder.content(text);
                }
                let calls: Vec<ChatCompletionMessageToolCall> = message
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolUse { id, name, input } => {
                            Some(ChatCompletionMessageToolCall {
                                id: id.clone(),
                                r#type: ChatCompletionToolType::Function,
                                function: FunctionCall {
                                    name: names.wire_name(name),
                                    arguments: input.to_string(),
                                },
                            })
                        }
                        _ => None,
                    })
                    .collect();
                if !calls.is_empty() {
                    builder.tool_calls(calls);
                }
                out.push(ChatCompletionRequestMessage::Assistant(
                    builder.build().map_err(ser)?,
                ));
            }
        }
    }
    Ok(out)
}

/// Tool result text as sent to OpenAI-shaped APIs, which lack an error flag.
pub(crate) fn tool_result_text(content: &str, is_error: bool) -> String {
    if is_error {
        format!("Error: {content}")
    } else {
        content.to_string()
    }
}

/// Converts one (wire-named) tool definition into an OpenAI function tool.
fn convert_tool(t: &ToolApiDefinition) -> Result<ChatCompletionTool, LlmError> {
    Ok(ChatCompletionTool {
        r#type: ChatCompletionToolType::Function,
        function: FunctionObjectArgs::default()
            .name(t.name.clone())
            .description(t.description.clone())
            .parameters(schema::parameters_schema(&t.parameters))
            .build()
            .map_err(|e| LlmError::Serialization(e.to_string()))?,
    })
}

/// Adapts an async-openai chunk stream into [`StreamEvent`]s.
struct OpenAiStream {
    inner: ChatCompletionResponseStream,
    names: ToolNameMap,
    acc: StreamAccumulator,
    queue: VecDeque<StreamEvent>,
    finish: Option<FinishReason>,
    usage: Option<Usage>,
    done: bool,
}

impl OpenAiStream {
    fn new(inner: ChatCompletionResponseStream, names: ToolNameMap) -> Self {
        Self {
            inner,
            names,
            acc: StreamAccumulator::new(),
            queue: VecDeque::new(),
            finish: None,
            usage: None,
            done: false,
        }
    }

    fn into_events(self) -> EventStream {
        Box::pin(stream::unfold(self, |mut state| async move {
            loop {
                if let Some(event) = state.queue.pop_front() {
                    return Some((event, state));
                }
                if state.done {
                    return None;
                }
                match state.inner.next().await {
                    Some(Ok(chunk)) => state.on_chunk(chunk),
                    Some(Err(e)) => {
                        state.done = true;
                        state.queue.push_back(StreamEvent::Error(map_openai_error(e)));
                    }
                    None => {
                        state.done = true;
                        let event = match state.complete() {
                            Ok(response) => StreamEvent::Complete(response),
                            Err(e) => StreamEvent::Error(e),
                        };
                        state.queue.push_back(event);
                    }
                }
            }
        }))
    }

    fn emit(&mut self, event: StreamEvent) {
        self.acc.push(&event);
        self.queue.push_back(event);
    }

    fn on_chunk(&mut self, chunk: CreateChatCompletionStreamResponse) {
        if let Some(u) = chunk.usage {
            self.usage = Some(Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            });
        }
        for choice in chunk.choices {
            if let Some(text) = choice.delta.content
                && !text.is_empty()
            {
                self.emit(StreamEvent::TextDelta(text));
            }
            for call in choice.delta.tool_calls.unwrap_or_default() {
                let (name, arguments) = match call.function {
                    Some(f) => (f.name, f.arguments),
                    None => (None, None),
                };
                if let Some(id) = call.id {
                    let name = self.names.original_name(&name.unwrap_or_default());
                    self.emit(StreamEvent::ToolUseStart { id, name });
                }
                if let Some(fragment) = arguments
                    && !fragment.is_empty()
                {
                    self.emit(StreamEvent::ToolUseInputDelta(fragment));
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.finish = Some(reason);
            }
        }
    }

    fn complete(&mut self) -> Result<CompletionResponse, LlmError> {
        let reason = self.finish.take().ok_or_else(|| {
            LlmError::Protocol("stream ended before a finish_reason was sent".to_string())
        })?;
        let content = std::mem::take(&mut self.acc).finish()?;
        Ok(CompletionResponse::new(
            content,
            stop_reason_from_finish(reason),
            self.usage,
        ))
    }
}
