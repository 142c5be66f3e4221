//! End-to-end runs of the agent loop against a mocked Anthropic endpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use agent::{
    AgentRuntime, AnthropicProvider, ApprovalRendezvous, AutonomyPolicy, ConversationStore,
    RuntimeConfig, SqliteMemory, StopReason, ToolRegistry, TurnStatus,
};
use async_trait::async_trait;
use mockito::Matcher;
use proto::{
    AgentEvent, ApprovalResult, AutonomyLevel, ContentBlock, ConversationId, ParameterProperty,
    Role, ToolParameters, ToolResult,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tools::Tool;

struct SmsTool {
    sent: AtomicUsize,
}

#[async_trait]
impl Tool for SmsTool {
    fn name(&self) -> &str {
        "sms.send"
    }

    fn description(&self) -> &str {
        "Send a text message"
    }

    fn requires_approval(&self) -> bool {
        true
    }

    fn parameters(&self) -> ToolParameters {
        ToolParameters::new()
            .required("to", ParameterProperty::string("Recipient"))
            .required("body", ParameterProperty::string("Message text"))
    }

    fn describe_call(&self, input: &Value) -> String {
        format!(
            "Text {} \"{}\"",
            input["to"].as_str().unwrap_or("?"),
            input["body"].as_str().unwrap_or_default()
        )
    }

    async fn execute(&self, input: Value) -> ToolResult {
        self.sent.fetch_add(1, Ordering::SeqCst);
        ToolResult::success(json!({ "delivered_to": input["to"] }))
    }
}

fn sse(events: &[Value]) -> String {
    events
        .iter()
        .map(|event| {
            let name = event["type"].as_str().unwrap_or("message");
            format!("event: {name}\ndata: {event}\n\n")
        })
        .collect()
}

fn tool_call_stream() -> String {
    sse(&[
        json!({"type": "message_start", "message": {"usage": {"input_tokens": 40, "output_tokens": 1}}}),
        json!({"type": "content_block_start", "index": 0,
               "content_block": {"type": "tool_use", "id": "tu_1", "name": "sms_send", "input": {}}}),
        json!({"type": "content_block_delta", "index": 0,
               "delta": {"type": "input_json_delta", "partial_json": "{\"to\": \"mom\", "}}),
        json!({"type": "content_block_delta", "index": 0,
               "delta": {"type": "input_json_delta", "partial_json": "\"body\": \"running late\"}"}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 20}}),
        json!({"type": "message_stop"}),
    ])
}

fn text_stream(text: &str) -> String {
    sse(&[
        json!({"type": "message_start", "message": {"usage": {"input_tokens": 60, "output_tokens": 1}}}),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": text}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 5}}),
        json!({"type": "message_stop"}),
    ])
}

async fn open_store(dir: &tempfile::TempDir) -> Arc<SqliteMemory> {
    let path = dir.path().join("pilot.db");
    Arc::new(
        SqliteMemory::open(&path.to_string_lossy())
            .await
            .expect("open sqlite"),
    )
}

#[tokio::test]
async fn streamed_tool_call_waits_for_human_approval() {
    let mut server = mockito::Server::new_async().await;
    let first = server
        .mock("POST", "/v1/messages")
        .match_body(Matcher::Regex(
            r#""messages":\[\{"role":"user","content":\[\{"type":"text","text":"tell mom I'm late"\}\]\}\]"#
                .to_string(),
        ))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(tool_call_stream())
        .create_async()
        .await;
    let second = server
        .mock("POST", "/v1/messages")
        .match_body(Matcher::Regex(r#""type":"tool_result","tool_use_id":"tu_1""#.to_string()))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(text_stream("Done, mom knows."))
        .create_async()
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let sms = Arc::new(SmsTool {
        sent: AtomicUsize::new(0),
    });
    let registry = Arc::new(ToolRegistry::new());
    registry.register(sms.clone());
    let rendezvous = Arc::new(ApprovalRendezvous::new());
    let runtime = AgentRuntime::new(
        Arc::new(AnthropicProvider::with_base_url(
            "sk-test",
            server.url(),
            "claude-sonnet",
        )),
        registry,
        store.clone(),
        Arc::new(AutonomyPolicy::new()),
        rendezvous.clone(),
        RuntimeConfig::default(),
    );

    let conversation = ConversationId::from("phone");
    let (tx, mut rx) = mpsc::channel(64);
    let responder = async {
        let mut pending = rendezvous.subscribe();
        pending
            .wait_for(|p| !p.is_empty())
            .await
            .expect("rendezvous alive");
        let request = rendezvous.pending().remove(0);
        assert_eq!(request.tool_name, "sms.send");
        assert_eq!(request.description, "Text mom \"running late\"");
        assert!(rendezvous.respond(&request.id, ApprovalResult::Approved));
    };
    let (outcome, ()) = tokio::join!(
        runtime.submit_message(&conversation, "tell mom I'm late", Some(tx)),
        responder
    );

    first.assert_async().await;
    second.assert_async().await;
    assert!(matches!(
        outcome.status,
        TurnStatus::Done {
            stop_reason: StopReason::EndTurn
        }
    ));
    assert_eq!(outcome.text, "Done, mom knows.");
    assert_eq!(outcome.rounds, 1);
    assert_eq!(outcome.usage.input_tokens, 100);
    assert_eq!(sms.sent.load(Ordering::SeqCst), 1);

    let transcript = store.recent(&conversation, 0).await.expect("transcript");
    assert_eq!(transcript.len(), 4);
    assert_eq!(transcript[1].role, Role::Assistant);
    assert_eq!(
        transcript[1].content,
        vec![ContentBlock::tool_use(
            "tu_1",
            "sms.send",
            json!({"to": "mom", "body": "running late"})
        )]
    );
    assert!(transcript[2].has_tool_results());

    let mut streamed = String::new();
    while let Ok(event) = rx.try_recv() {
        if let AgentEvent::TextDelta(delta) = event {
            streamed.push_str(&delta);
        }
    }
    assert_eq!(streamed, "Done, mom knows.");
}

#[tokio::test]
async fn denied_tool_and_history_survive_a_restart() {
    let mut server = mockito::Server::new_async().await;
    let first = server
        .mock("POST", "/v1/messages")
        .match_body(Matcher::Regex(
            r#""messages":\[\{"role":"user","content":\[\{"type":"text","text":"text mom"\}\]\}\]"#
                .to_string(),
        ))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(tool_call_stream())
        .create_async()
        .await;
    let refusal = server
        .mock("POST", "/v1/messages")
        .match_body(Matcher::Regex(r#""is_error":true"#.to_string()))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(text_stream("Texting is turned off."))
        .expect(2)
        .create_async()
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let sms = Arc::new(SmsTool {
        sent: AtomicUsize::new(0),
    });
    let conversation = ConversationId::from("phone");

    for prompt in ["text mom", "why not?"] {
        let store = open_store(&dir).await;
        let registry = Arc::new(ToolRegistry::new());
        registry.register(sms.clone());
        let policy = Arc::new(AutonomyPolicy::new());
        policy.set_policy("sms.send", AutonomyLevel::Deny);
        let runtime = AgentRuntime::new(
            Arc::new(AnthropicProvider::with_base_url(
                "sk-test",
                server.url(),
                "claude-sonnet",
            )),
            registry,
            store,
            policy,
            Arc::new(ApprovalRendezvous::new()),
            RuntimeConfig::default(),
        );
        let outcome = runtime.submit_message(&conversation, prompt, None).await;
        assert!(outcome.is_done(), "{prompt}: {:?}", outcome.status);
        assert_eq!(outcome.text, "Texting is turned off.");
    }

    first.assert_async().await;
    refusal.assert_async().await;
    assert_eq!(sms.sent.load(Ordering::SeqCst), 0);

    let store = open_store(&dir).await;
    let transcript = store.recent(&conversation, 0).await.expect("transcript");
    assert_eq!(transcript.len(), 6);
    assert_eq!(transcript[4], proto::Message::user("why not?"));
    assert_eq!(transcript[5].text(), "Texting is turned off.");
    assert_eq!(
        store.list_conversations().await.expect("list"),
        vec![conversation]
    );
}
