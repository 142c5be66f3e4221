//! Anthropic Messages API provider implementation.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::RwLock;
use proto::{ContentBlock, LlmError, Message, Role};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::llm::{
    CompletionRequest, CompletionResponse, EventStream, LlmProvider, ProviderSettings, StopReason,
    StreamAccumulator, StreamEvent, Usage, error_stream,
};
use crate::schema::{self, ToolNameMap};
use crate::sse::{self, FrameHandler, SseFrame};

const ANTHROPIC_API_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

// ── Request types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<WireBlock>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    /// Block kinds this client does not consume (e.g. thinking).
    #[serde(other)]
    Unsupported,
}

// ── Response types ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<WireBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireStreamEvent {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockStart {
        content_block: WireBlock,
    },
    ContentBlockDelta {
        delta: WireDelta,
    },
    ContentBlockStop,
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: WireError,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

// ── Provider ───────────────────────────────────────────────────────────────────

/// Anthropic Messages API LLM provider.
pub struct AnthropicProvider {
    client: reqwest::Client,
    settings: RwLock<ProviderSettings>,
    base_url: String,
}

impl AnthropicProvider {
    /// Creates a provider targeting the default Anthropic API endpoint.
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
        }
    }

    fn snapshot(&self) -> Result<ProviderSettings, LlmError> {
        let settings = self.settings.read().clone();
        settings.validate("anthropic")?;
        Ok(settings)
    }

    fn build_request(
        &self,
        settings: &ProviderSettings,
        req: &CompletionRequest,
        names: &ToolNameMap,
        stream: bool,
    ) -> reqwest::RequestBuilder {
        let body = AnthropicRequest {
            model: settings.model.clone(),
            max_tokens: req.max_tokens,
            system: (!req.system_prompt.is_empty()).then(|| req.system_prompt.clone()),
            messages: convert_messages(&req.messages, names),
            tools: schema::to_anthropic_tools(&names.wire_definitions(&req.tools)),
            stream,
        };

        debug!(
            model = %settings.model,
            messages = %body.messages.len(),
            tools = %body.tools.len(),
            stream,
            "Sending request to Anthropic"
        );

        let url = format!("{}/v1/messages", self.base_url);
        let builder = self
            .client
            .post(&url)
            .header("anthropic-version", ANTHROPIC_API_VERSION)
            .json(&body);

        if proto::is_anthropic_oauth_token(&settings.api_key) {
            builder.bearer_auth(&settings.api_key)
        } else {
            builder.header("x-api-key", &settings.api_key)
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
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
        trace!(body = %body, "Anthropic response body");

        let parsed: AnthropicResponse = serde_json::from_str(&body).map_err(|e| {
            LlmError::Protocol(format!(
                "Deserialization error: {e}; body: {}",
                body.chars().take(200).collect::<String>()
            ))
        })?;

        let content = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                WireBlock::Text { text } => Some(ContentBlock::text(text)),
                WireBlock::ToolUse { id, name, input } => Some(ContentBlock::tool_use(
                    id,
                    names.original_name(&name),
                    input,
                )),
                WireBlock::ToolResult { .. } | WireBlock::Unsupported => None,
            })
            .collect();

        let stop_reason = parsed
            .stop_reason
            .as_deref()
            .map(StopReason::from_anthropic)
            .unwrap_or(StopReason::EndTurn);
        let usage = parsed.usage.map(|u| Usage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
        });
        Ok(CompletionResponse::new(content, stop_reason, usage))
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
        sse::into_event_stream(frames, AnthropicStream::new(names))
    }
}

/// Per-stream state translating Anthropic SSE events.
struct AnthropicStream {
    names: ToolNameMap,
    acc: StreamAccumulator,
    usage: Usage,
    stop_reason: Option<String>,
}

impl AnthropicStream {
    fn new(names: ToolNameMap) -> Self {
        Self {
            names,
            acc: StreamAccumulator::new(),
            usage: Usage::default(),
            stop_reason: None,
        }
    }

    fn emit(&mut self, event: StreamEvent, out: &mut VecDeque<StreamEvent>) {
        self.acc.push(&event);
        out.push_back(event);
    }
}

impl FrameHandler for AnthropicStream {
    fn on_frame(
        &mut self,
        frame: SseFrame,
        out: &mut VecDeque<StreamEvent>,
    ) -> Result<bool, LlmError> {
        let event: WireStreamEvent = serde_json::from_str(&frame.data).map_err(|e| {
            LlmError::Protocol(format!("bad '{}' event: {e}", frame.event))
        })?;

        match event {
            WireStreamEvent::MessageStart { message } => {
                self.usage.input_tokens = message.usage.input_tokens;
                self.usage.output_tokens = message.usage.output_tokens;
            }
            WireStreamEvent::ContentBlockStart { content_block } => match content_block {
                WireBlock::Text { text } if !text.is_empty() => {
                    self.emit(StreamEvent::TextDelta(text), out)
                }
                WireBlock::ToolUse { id, name, .. } => {
                    let name = self.names.original_name(&name);
                    self.emit(StreamEvent::ToolUseStart { id, name }, out);
                }
                _ => {}
            },
            WireStreamEvent::ContentBlockDelta { delta } => match delta {
                WireDelta::TextDelta { text } => self.emit(StreamEvent::TextDelta(text), out),
                WireDelta::InputJsonDelta { partial_json } => {
                    if !partial_json.is_empty() {
                        self.emit(StreamEvent::ToolUseInputDelta(partial_json), out);
                    }
                }
                WireDelta::Other => {}
            },
            WireStreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                if let Some(u) = usage {
                    self.usage.output_tokens = u.output_tokens;
                }
            }
            WireStreamEvent::MessageStop => {
                let content = std::mem::take(&mut self.acc).finish()?;
                let stop_reason = self
                    .stop_reason
                    .as_deref()
                    .map(StopReason::from_anthropic)
                    .unwrap_or(StopReason::EndTurn);
                out.push_back(StreamEvent::Complete(CompletionResponse::new(
                    content,
                    stop_reason,
                    Some(self.usage),
                )));
                return Ok(true);
            }
            WireStreamEvent::Error { error } => return Err(stream_error(error)),
            WireStreamEvent::ContentBlockStop | WireStreamEvent::Ping | WireStreamEvent::Unknown => {}
        }
        Ok(false)
    }

    fn on_eof(&mut self) -> StreamEvent {
        StreamEvent::Error(LlmError::Protocol(
            "stream ended before message_stop".to_string(),
        ))
    }
}

fn stream_error(error: WireError) -> LlmError {
    match error.kind.as_str() {
        "rate_limit_error" => LlmError::RateLimit,
        "overloaded_error" => LlmError::Api {
            status: 529,
            message: error.message,
        },
        "api_error" => LlmError::Api {
            status: 500,
            message: error.message,
        },
        _ => LlmError::Rejected(format!("{}: {}", error.kind, error.message)),
    }
}

// ── Conversion helpers ─────────────────────────────────────────────────────────

/// Converts the transcript into Anthropic messages.
///
/// Consecutive same-role messages are merged (Anthropic forbids them) and
/// empty text blocks are dropped.
fn convert_messages(messages: &[Message], names: &ToolNameMap) -> Vec<AnthropicMessage> {
    let mut result: Vec<AnthropicMessage> = Vec::new();

    for msg in messages {
        let role = match msg.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let blocks: Vec<WireBlock> = msg
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } if text.is_empty() => None,
                ContentBlock::Text { text } => Some(WireBlock::Text { text: text.clone() }),
                ContentBlock::ToolUse { id, name, input } => Some(WireBlock::ToolUse {
                    id: id.clone(),
                    name: names.wire_name(name),
                    input: input.clone(),
                }),
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => Some(WireBlock::ToolResult {
                    tool_use_id: tool_use_id.clone(),
                    content: content.clone(),
                    is_error: *is_error,
                }),
            })
            .collect();
        if blocks.is_empty() {
            continue;
        }

        match result.last_mut() {
            Some(last) if last.role == role => last.content.extend(blocks),
            _ => result.push(AnthropicMessage {
                role,
                content: blocks,
            }),
        }
    }

    result
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use proto::{ParameterProperty, ToolApiDefinition, ToolParameters};
    use serde_json::json;

    use crate::llm::collect_stream;

    fn catalog() -> Vec<ToolApiDefinition> {
        vec![ToolApiDefinition::new(
            "sms.send",
            "Send an SMS",
            ToolParameters::new()
                .required("to", ParameterProperty::string("Recipient"))
                .required("body", ParameterProperty::string("Text")),
        )]
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new("You are a phone assistant.", vec![Message::user("text mom hi")])
            .with_tools(catalog())
    }

    #[test]
    fn provider_with_base_url_trims_trailing_slash() {
        let p = AnthropicProvider::with_base_url("sk-test", "http://localhost:8080/", "claude");
        assert_eq!(p.base_url, "http://localhost:8080");
        assert_eq!(AnthropicProvider::new("k", "m").base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn convert_messages_merges_same_role_and_keeps_error_flag() {
        let names = ToolNameMap::new(&catalog()).expect("names");
        let messages = vec![
            Message::user("hi"),
            Message::user("again"),
            Message::assistant(vec![
                ContentBlock::text(""),
                ContentBlock::tool_use("tu_1", "sms.send", json!({"to":"1"})),
            ]),
            Message::tool_results(vec![ContentBlock::tool_result("tu_1", "denied", true)]),
        ];
        let converted = convert_messages(&messages, &names);
        assert_eq!(converted.len(), 3);
        assert_eq!(converted[0].content.len(), 2);

        let wire = serde_json::to_value(&converted[1].content).expect("json");
        assert_eq!(wire, json!([{"type":"tool_use","id":"tu_1","name":"sms_send","input":{"to":"1"}}]));

        let wire = serde_json::to_value(&converted[2].content).expect("json");
        assert_eq!(
            wire,
            json!([{"type":"tool_result","tool_use_id":"tu_1","content":"denied","is_error":true}])
        );
    }

    #[test]
    fn unknown_block_types_deserialize_as_unsupported() {
        let blocks: Vec<WireBlock> =
            serde_json::from_str(r#"[{"type":"thinking","thinking":"..."},{"type":"text","text":"ok"}]"#)
                .expect("blocks");
        assert!(matches!(blocks[0], WireBlock::Unsupported));
        assert!(matches!(&blocks[1], WireBlock::Text { text } if text == "ok"));
    }

    #[tokio::test]
    async fn complete_parses_tool_use_and_restores_dotted_name() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "sk-test")
            .match_header("anthropic-version", ANTHROPIC_API_VERSION)
            .match_body(mockito::Matcher::PartialJson(json!({
                "model": "claude-sonnet",
                "system": "You are a phone assistant.",
                "tools": [{"name": "sms_send"}],
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "content": [
                        {"type": "text", "text": "Sending."},
                        {"type": "tool_use", "id": "tu_1", "name": "sms_send",
                         "input": {"to": "mom", "body": "hi"}}
                    ],
                    "stop_reason": "tool_use",
                    "usage": {"input_tokens": 12, "output_tokens": 7}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let provider = AnthropicProvider::with_base_url("sk-test", server.url(), "claude-sonnet");
        let response = provider.complete(request()).await.expect("response");
        mock.assert_async().await;

        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.text(), "Sending.");
        assert_eq!(
            response.content[1],
            ContentBlock::tool_use("tu_1", "sms.send", json!({"to":"mom","body":"hi"}))
        );
        assert_eq!(
            response.usage,
            Some(Usage {
                input_tokens: 12,
                output_tokens: 7
            })
        );
    }

    #[tokio::test]
    async fn complete_maps_http_errors() {
        let mut server = mockito::Server::new_async().await;
        let _limited = server
            .mock("POST", "/v1/messages")
            .with_status(429)
            .with_body(r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow down"}}"#)
            .create_async()
            .await;
        let provider = AnthropicProvider::with_base_url("sk-test", server.url(), "claude");
        let err = provider.complete(request()).await.expect_err("rate limited");
        assert!(matches!(err, LlmError::RateLimit));

        let mut server = mockito::Server::new_async().await;
        let _bad = server
            .mock("POST", "/v1/messages")
            .with_status(400)
            .with_body(r#"{"type":"error","error":{"type":"invalid_request_error","message":"bad tools"}}"#)
            .create_async()
            .await;
        let provider = AnthropicProvider::with_base_url("sk-test", server.url(), "claude");
        let err = provider.complete(request()).await.expect_err("bad request");
        assert!(matches!(err, LlmError::Api { status: 400, ref message } if message == "bad tools"));
    }

    #[tokio::test]
    async fn complete_rejects_malformed_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;
        let provider = AnthropicProvider::with_base_url("sk-test", server.url(), "claude");
        let err = provider.complete(request()).await.expect_err("malformed");
        assert!(matches!(err, LlmError::Protocol(_)));
    }

    #[tokio::test]
    async fn oauth_tokens_use_bearer_auth() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .match_header("authorization", "Bearer sk-ant-oat01-abc")
            .with_status(200)
            .with_body(r#"{"content":[{"type":"text","text":"hi"}],"stop_reason":"end_turn"}"#)
            .create_async()
            .await;
        let provider = AnthropicProvider::with_base_url("sk-ant-oat01-abc", server.url(), "claude");
        let response = provider.complete(request()).await.expect("response");
        mock.assert_async().await;
        assert_eq!(response.stop_reason, StopReason::EndTurn);
        assert_eq!(response.usage, None);
    }

    #[tokio::test]
    async fn stream_reconstructs_tool_input_from_deltas() {
        let body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":20,\"output_tokens\":1}}}\n\n",
            "event: content_block_start\n",
            "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"On it\"}}\n\n",
            "event: content_block_stop\n",
            "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
            "event: ping\n",
            "data: {\"type\":\"ping\"}\n\n",
            "event: content_block_start\n",
            "data: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"tu_9\",\"name\":\"sms_send\",\"input\":{}}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"to\\\": \\\"mom\\\",\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\" \\\"body\\\": \\\"hi\\\"}\"}}\n\n",
            "event: content_block_stop\n",
            "data: {\"type\":\"content_block_stop\",\"index\":1}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"},\"usage\":{\"output_tokens\":31}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );

        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .match_body(mockito::Matcher::PartialJson(json!({"stream": true})))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let provider = AnthropicProvider::with_base_url("sk-test", server.url(), "claude");
        let events = provider.stream(request()).await;
        let mut text = String::new();
        let response = collect_stream(events, |t| {
            text.push_str(&t);
            async {}
        })
        .await
        .expect("response");
        mock.assert_async().await;

        assert_eq!(text, "On it");
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(
            response.content,
            vec![
                ContentBlock::text("On it"),
                ContentBlock::tool_use("tu_9", "sms.send", json!({"to":"mom","body":"hi"})),
            ]
        );
        assert_eq!(
            response.usage,
            Some(Usage {
                input_tokens: 20,
                output_tokens: 31
            })
        );
    }

    #[tokio::test]
    async fn stream_surfaces_error_event_and_truncation() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(concat!(
                "event: error\n",
                "data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
            ))
            .create_async()
            .await;
        let provider = AnthropicProvider::with_base_url("sk-test", server.url(), "claude");
        let mut events = provider.stream(request()).await;
        match events.next().await {
            Some(StreamEvent::Error(err)) => assert!(err.is_transient()),
            other => panic!("expected error event, got {other:?}"),
        }
        assert!(events.next().await.is_none());

        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(concat!(
                "event: content_block_delta\n",
                "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"partial\"}}\n\n",
            ))
            .create_async()
            .await;
        let provider = AnthropicProvider::with_base_url("sk-test", server.url(), "claude");
        let events = provider.stream(request()).await;
        let err = collect_stream(events, |_| async {}).await.expect_err("truncated");
        assert!(matches!(err, LlmError::Protocol(_)));
    }

    #[tokio::test]
    async fn empty_api_key_is_a_config_error_without_network() {
        let provider = AnthropicProvider::with_base_url("", "http://127.0.0.1:9", "claude");
        let err = provider.complete(request()).await.expect_err("config");
        assert!(matches!(err, LlmError::Config(_)));

        provider.configure("sk-test", "claude-haiku");
        assert_eq!(provider.snapshot().expect("configured").model, "claude-haiku");
        assert_eq!(provider.name(), "anthropic");
    }
}
