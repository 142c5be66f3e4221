//! OpenRouter provider speaking the OpenAI-compatible chat wire format.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::RwLock;
use proto::{ContentBlock, LlmError, Message, Role};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, trace};

use crate::llm::{
    CompletionRequest, CompletionResponse, EventStream, LlmProvider, ProviderSettings, StopReason,
    StreamAccumulator, StreamEvent, Usage, error_stream, parse_tool_input, tool_result_text,
};
use crate::schema::{self, ToolNameMap};
use crate::sse::{self, FrameHandler, SseFrame};

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_APP_TITLE: &str = "pilot";

// ── Response types ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(u: WireUsage) -> Self {
        Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    error: Option<ChunkError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChunkFunction>,
}

#[derive(Debug, Deserialize)]
struct ChunkFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkError {
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    message: String,
}

// ── Provider ───────────────────────────────────────────────────────────────────

/// OpenRouter chat completions provider.
pub struct OpenRouterProvider {
    client: reqwest::Client,
    settings: RwLock<ProviderSettings>,
    base_url: String,
    referer: Option<String>,
    title: String,
}

impl OpenRouterProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL, model)
    }

    /// Creates a provider targeting a custom base URL (useful for proxies/tests).
    pub fn with_base_url(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings: RwLock::new(ProviderSettings::new(api_key, model)),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            referer: None,
            title: DEFAULT_APP_TITLE.to_string(),
        }
    }

    /// Sets the `HTTP-Referer` / `X-Title` attribution headers.
    pub fn with_attribution(mut self, referer: Option<String>, title: impl Into<String>) -> Self {
        self.referer = referer;
        self.title = title.into();
        self
    }

    fn snapshot(&self) -> Result<ProviderSettings, LlmError> {
        let settings = self.settings.read().clone();
        settings.validate("openrouter")?;
        Ok(settings)
    }

    fn build_request(
        &self,
        settings: &ProviderSettings,
        req: &CompletionRequest,
        names: &ToolNameMap,
        stream: bool,
    ) -> reqwest::RequestBuilder {
        let mut body = json!({
            "model": settings.model,
            "messages": convert_messages(&req.system_prompt, &req.messages, names),
            "max_tokens": req.max_tokens,
        });
        if !req.tools.is_empty() {
            body["tools"] = json!(schema::to_openai_tools(&names.wire_definitions(&req.tools)));
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }

        debug!(
            model = %settings.model,
            messages = %req.messages.len(),
            tools = %req.tools.len(),
            stream,
            "Sending request to OpenRouter"
        );

        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .bearer_auth(&settings.api_key)
            .header("X-Title", &self.title)
            .json(&body);
        if let Some(referer) = &self.referer {
            builder = builder.header("HTTP-Referer", referer);
        }
        builder
    }
}

#[async_trait]
impl LlmProvider for OpenRouterProvider {
    fn name(&self) -> &str {
        "openrouter"
    }

    fn configure(&self, api_key: &str, model: &str) {
        *self.settings.write() = ProviderSettings::new(api_key, model);
    }

    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let settings = self.snapshot()?;
        let names = ToolNameMap::new(&req.tools)?;
        let response = sse::send_checked(self.build_request(&settings, &req, &names, false)).await?;
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        trace!(body = %body, "OpenRouter response body");
        parse_completion(&body, &names)
    }

    async fn stream(&self, req: CompletionRequest) -> EventStream {
        let settings = match self.snapshot() {
            Ok(s) => s,
            Err(e) => return error_stream(e),
        };
        let names = match ToolNameMap::new(&req.tools) {
            Ok(n) => n,
            Err(e) => return error_stream(e),
        };
        let response =
            match sse::send_checked(self.build_request(&settings, &req, &names, true)).await {
                Ok(r) => r,
                Err(e) => return error_stream(e),
            };
        let frames = sse::decode_sse(response.bytes_stream());
        sse::into_event_stream(frames, ChunkStream::new(names))
    }
}

fn parse_completion(body: &str, names: &ToolNameMap) -> Result<CompletionResponse, LlmError> {
    let parsed: ChatCompletion = serde_json::from_str(body).map_err(|e| {
        LlmError::Protocol(format!(
            "Deserialization error: {e}; body: {}",
            body.chars().take(200).collect::<String>()
        ))
    })?;
    let choice = parsed
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
        .as_deref()
        .map(StopReason::from_openai)
        .unwrap_or(StopReason::EndTurn);
    Ok(CompletionResponse::new(
        content,
        stop_reason,
        parsed.usage.map(Usage::from),
    ))
}

/// Per-stream state for OpenAI-style `chat.completion.chunk` frames.
struct ChunkStream {
    names: ToolNameMap,
    acc: StreamAccumulator,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

impl ChunkStream {
    fn new(names: ToolNameMap) -> Self {
        Self {
            names,
            acc: StreamAccumulator::new(),
            finish_reason: None,
            usage: None,
        }
    }

    fn emit(&mut self, event: StreamEvent, out: &mut VecDeque<StreamEvent>) {
        self.acc.push(&event);
        out.push_back(event);
    }

    fn complete(&mut self) -> Result<CompletionResponse, LlmError> {
        let reason = self.finish_reason.take().ok_or_else(|| {
            LlmError::Protocol("stream ended before a finish_reason was sent".to_string())
        })?;
        let content = std::mem::take(&mut self.acc).finish()?;
        Ok(CompletionResponse::new(
            content,
            StopReason::from_openai(&reason),
            self.usage,
        ))
    }
}

impl FrameHandler for ChunkStream {
    fn on_frame(
        &mut self,
        frame: SseFrame,
        out: &mut VecDeque<StreamEvent>,
    ) -> Result<bool, LlmError> {
        if frame.data.trim() == "[DONE]" {
            out.push_back(StreamEvent::Complete(self.complete()?));
            return Ok(true);
        }

        let chunk: ChatChunk = serde_json::from_str(&frame.data)
            .map_err(|e| LlmError::Protocol(format!("bad stream chunk: {e}")))?;

        if let Some(error) = chunk.error {
            let status = error
                .code
                .as_ref()
                .and_then(Value::as_u64)
                .and_then(|c| u16::try_from(c).ok())
                .unwrap_or(500);
            return Err(sse::status_error(
                status,
                &json!({"error": {"message": error.message}}).to_string(),
            ));
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage.into());
        }

        for choice in chunk.choices {
            let delta = choice.delta.unwrap_or_default();
            if let Some(text) = delta.content
                && !text.is_empty()
            {
                self.emit(StreamEvent::TextDelta(text), out);
            }
            for call in delta.tool_calls.unwrap_or_default() {
                let (name, arguments) = match call.function {
                    Some(f) => (f.name, f.arguments),
                    None => (None, None),
                };
                if let Some(id) = call.id {
                    let name = self.names.original_name(&name.unwrap_or_default());
                    self.emit(StreamEvent::ToolUseStart { id, name }, out);
                }
                if let Some(fragment) = arguments
                    && !fragment.is_empty()
                {
                    self.emit(StreamEvent::ToolUseInputDelta(fragment), out);
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
        }
        Ok(false)
    }

    fn on_eof(&mut self) -> StreamEvent {
        // Some compatible servers close the body without a [DONE] sentinel.
        match self.complete() {
            Ok(response) => StreamEvent::Complete(response),
            Err(e) => StreamEvent::Error(e),
        }
    }
}

/// Converts the transcript into OpenAI-shaped JSON messages.
fn convert_messages(system_prompt: &str, messages: &[Message], names: &ToolNameMap) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if !system_prompt.is_empty() {
        out.push(json!({"role": "system", "content": system_prompt}));
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
                        } => out.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "content": tool_result_text(content, *is_error),
                        })),
                        ContentBlock::ToolUse { .. } => {}
                    }
                }
                if !text.is_empty() {
                    out.push(json!({"role": "user", "content": text}));
                }
            }
            Role::Assistant => {
                let text = message.text();
                let content = if text.is_empty() {
                    Value::Null
                } else {
                    Value::String(text)
                };
                let mut obj = json!({"role": "assistant", "content": content});
                let calls: Vec<Value> = message
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolUse { id, name, input } => Some(json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": names.wire_name(name),
                                "arguments": input.to_string(),
                            }
                        })),
                        _ => None,
                    })
                    .collect();
                if !calls.is_empty() {
                    obj["tool_calls"] = json!(calls);
                }
                out.push(obj);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proto::{ParameterProperty, ToolApiDefinition, ToolParameters};

    use crate::llm::collect_stream;

    fn catalog() -> Vec<ToolApiDefinition> {
        vec![ToolApiDefinition::new(
            "settings.set",
            "Change a device setting",
            ToolParameters::new()
                .required(
                    "key",
                    ParameterProperty::string("Setting").with_enum(["wifi", "bluetooth"]),
                )
                .required("value", ParameterProperty::new("boolean", "On or off")),
        )]
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new("sys", vec![Message::user("turn wifi off")]).with_tools(catalog())
    }

    #[test]
    fn convert_messages_emits_tool_role_and_null_content() {
        let names = ToolNameMap::new(&catalog()).expect("names");
        let messages = vec![
            Message::user("turn wifi off"),
            Message::assistant(vec![ContentBlock::tool_use(
                "c1",
                "settings.set",
                json!({"key":"wifi","value":false}),
            )]),
            Message::tool_results(vec![ContentBlock::tool_result("c1", "{\"ok\":true}", false)]),
        ];
        let converted = convert_messages("sys", &messages, &names);
        assert_eq!(converted.len(), 4);
        assert_eq!(converted[0]["role"], "system");
        assert_eq!(converted[2]["content"], Value::Null);
        assert_eq!(converted[2]["tool_calls"][0]["function"]["name"], "settings_set");
        assert_eq!(converted[3]["role"], "tool");
        assert_eq!(converted[3]["tool_call_id"], "c1");
    }

    #[test]
    fn parse_completion_rejects_malformed_arguments() {
        let names = ToolNameMap::new(&catalog()).expect("names");
        let body = json!({
            "choices": [{
                "message": {"content": null, "tool_calls": [
                    {"id": "c1", "type": "function",
                     "function": {"name": "settings_set", "arguments": "{\"key\":"}}
                ]},
                "finish_reason": "tool_calls"
            }]
        })
        .to_string();
        assert!(matches!(
            parse_completion(&body, &names),
            Err(LlmError::Protocol(_))
        ));
        assert!(matches!(
            parse_completion(r#"{"choices":[]}"#, &names),
            Err(LlmError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn complete_sends_attribution_headers_and_maps_tool_calls() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-or-test")
            .match_header("x-title", "pilot-tests")
            .match_header("http-referer", "https://example.test")
            .match_body(mockito::Matcher::PartialJson(json!({
                "model": "anthropic/claude-sonnet-4",
                "max_tokens": 4096,
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "id": "gen-1",
                    "choices": [{
                        "message": {"role": "assistant", "content": "", "tool_calls": [
                            {"id": "c1", "type": "function",
                             "function": {"name": "settings_set",
                                          "arguments": "{\"key\":\"wifi\",\"value\":false}"}}
                        ]},
                        "finish_reason": "tool_calls"
                    }],
                    "usage": {"prompt_tokens": 40, "completion_tokens": 9}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let provider = OpenRouterProvider::with_base_url(
            "sk-or-test",
            server.url(),
            "anthropic/claude-sonnet-4",
        )
        .with_attribution(Some("https://example.test".to_string()), "pilot-tests");
        let response = provider.complete(request()).await.expect("response");
        mock.assert_async().await;

        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(
            response.content,
            vec![ContentBlock::tool_use(
                "c1",
                "settings.set",
                json!({"key":"wifi","value":false})
            )]
        );
        assert_eq!(response.usage.map(|u| u.input_tokens), Some(40));
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(503)
            .with_body(r#"{"error":{"message":"upstream unavailable","code":503}}"#)
            .create_async()
            .await;
        let provider = OpenRouterProvider::with_base_url("sk-or-test", server.url(), "m");
        let err = provider.complete(request()).await.expect_err("503");
        assert!(err.is_transient());
        assert!(err.to_string().contains("upstream unavailable"));
    }

    #[tokio::test]
    async fn stream_concatenates_deltas_and_stops_at_done() {
        let body = concat!(
            ": OPENROUTER PROCESSING\n\n",
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"Turning \"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"wifi off\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c7\",\"type\":\"function\",\"function\":{\"name\":\"settings_set\",\"arguments\":\"\"}}]},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"key\\\":\\\"wifi\\\",\"}}]},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"value\\\":false}\"}}]},\"finish_reason\":\"tool_calls\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":11,\"completion_tokens\":5}}\n\n",
            "data: [DONE]\n\n",
        );
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .match_body(mockito::Matcher::PartialJson(json!({"stream": true})))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let provider = OpenRouterProvider::with_base_url("sk-or-test", server.url(), "m");
        let mut text = String::new();
        let response = collect_stream(provider.stream(request()).await, |t| {
            text.push_str(&t);
            async {}
        })
        .await
        .expect("response");

        assert_eq!(text, "Turning wifi off");
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(
            response.content[1],
            ContentBlock::tool_use("c7", "settings.set", json!({"key":"wifi","value":false}))
        );
        assert_eq!(
            response.usage,
            Some(Usage {
                input_tokens: 11,
                output_tokens: 5
            })
        );
    }

    #[tokio::test]
    async fn stream_error_chunk_becomes_error_event() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body("data: {\"error\":{\"code\":429,\"message\":\"slow down\"}}\n\n")
            .create_async()
            .await;
        let provider = OpenRouterProvider::with_base_url("sk-or-test", server.url(), "m");
        let err = collect_stream(provider.stream(request()).await, |_| async {})
            .await
            .expect_err("error chunk");
        assert!(matches!(err, LlmError::RateLimit));
    }

    #[tokio::test]
    async fn stream_http_failure_is_single_error_event() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body(r#"{"error":{"message":"No auth credentials found","code":401}}"#)
            .create_async()
            .await;
        let provider = OpenRouterProvider::with_base_url("sk-or-bad", server.url(), "m");
        let err = collect_stream(provider.stream(request()).await, |_| async {})
            .await
            .expect_err("401");
        assert!(matches!(err, LlmError::Api { status: 401, .. }));
        assert!(!err.is_transient());
    }
}
