use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use toolloop::context::sanitize::has_parity;
use toolloop::normalize::strip_think;
use toolloop::{
    spawn_persister, AccessLevel, AgentError, Caller, CancellationToken, CompactionConfig,
    ConversationEngine, ConversationKey, ConversationState, ConversationStore, EngineConfig,
    InMemoryStore, InferenceError, InferenceProvider, InferenceRequest, Message, Permission,
    RegisterOptions, RegistryError, RetryConfig, Role, Tool, ToolChoice, ToolRegistry, TurnEvent,
    TurnOptions, TurnStatus, FAILURE_MESSAGE, TOOL_LIMIT_MESSAGE,
};

// --- Mock Provider ---

struct MockProvider {
    responses: Mutex<VecDeque<Result<Value, InferenceError>>>,
    requests: Mutex<Vec<InferenceRequest>>,
}

impl MockProvider {
    fn new(responses: Vec<Value>) -> Arc<Self> {
        Self::with_results(responses.into_iter().map(Ok).collect())
    }

    fn with_results(responses: Vec<Result<Value, InferenceError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    async fn requests(&self) -> Vec<InferenceRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl InferenceProvider for MockProvider {
    async fn infer(&self, request: InferenceRequest) -> Result<Value, InferenceError> {
        self.requests.lock().await.push(request);
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or(Err(InferenceError::Request("no more mock responses".into())))
    }
}

/// Never answers; used to observe cancellation mid-request.
struct StallingProvider;

#[async_trait]
impl InferenceProvider for StallingProvider {
    async fn infer(&self, _request: InferenceRequest) -> Result<Value, InferenceError> {
        std::future::pending().await
    }
}

// --- Reply builders ---

fn text_reply(content: &str) -> Value {
    json!({
        "model": "mock-model",
        "choices": [{"message": {"role": "assistant", "content": content}}],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
    })
}

fn tool_reply(calls: &[(&str, &str, Value)]) -> Value {
    let calls: Vec<Value> = calls
        .iter()
        .map(|(id, name, args)| {
            json!({
                "id": id,
                "type": "function",
                "function": {"name": name, "arguments": args.to_string()}
            })
        })
        .collect();
    json!({
        "model": "mock-model",
        "choices": [{"message": {"role": "assistant", "content": null, "tool_calls": calls}}],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
    })
}

fn empty_reply() -> Value {
    json!({"content": "", "tool_calls": []})
}

fn tool_use_failed() -> InferenceError {
    InferenceError::ApiError {
        status: 400,
        body: json!({
            "error": {
                "message": "Failed to call a function. Please adjust your prompt.",
                "type": "invalid_request_error",
                "code": "tool_use_failed",
                "failed_generation": "<function=list_documents>{\"type\": \"Item\"</function>"
            }
        })
        .to_string(),
    }
}

// --- Tools ---

struct ListDocuments;

#[async_trait]
impl Tool for ListDocuments {
    fn name(&self) -> &str {
        "list_documents"
    }

    fn description(&self) -> &str {
        "List documents of a type"
    }

    fn schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {"type": {"type": "string"}},
            "required": ["type"]
        }))
    }

    async fn execute(&self, args: &Value) -> Result<Value, String> {
        assert!(args.get("justification").is_none());
        Ok(json!({"documents": ["d1", "d2"], "type": args["type"]}))
    }
}

struct BrokenTool;

#[async_trait]
impl Tool for BrokenTool {
    fn name(&self) -> &str {
        "update_document"
    }

    fn description(&self) -> &str {
        "Update a document"
    }

    async fn execute(&self, _args: &Value) -> Result<Value, String> {
        Err("document is locked".into())
    }
}

struct SoftFailTool;

#[async_trait]
impl Tool for SoftFailTool {
    fn name(&self) -> &str {
        "read_document"
    }

    fn description(&self) -> &str {
        "Read one document"
    }

    async fn execute(&self, args: &Value) -> Result<Value, String> {
        Ok(json!({"error": format!("no document {}", args["id"])}))
    }
}

struct BigOutput;

#[async_trait]
impl Tool for BigOutput {
    fn name(&self) -> &str {
        "dump_log"
    }

    fn description(&self) -> &str {
        "Dump the full log"
    }

    async fn execute(&self, _args: &Value) -> Result<Value, String> {
        let lines: Vec<String> = (1..=200).map(|i| format!("line {i}")).collect();
        Ok(Value::String(lines.join("\n")))
    }
}

struct AdminOnly;

#[async_trait]
impl Tool for AdminOnly {
    fn name(&self) -> &str {
        "delete_world"
    }

    fn description(&self) -> &str {
        "Delete the whole world"
    }

    async fn execute(&self, _args: &Value) -> Result<Value, String> {
        Ok(json!({"deleted": true}))
    }
}

fn registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry
        .register_tool(ListDocuments, RegisterOptions::new().category("documents"))
        .unwrap();
    registry
        .register_tool(BrokenTool, RegisterOptions::new().requires(Permission::Write))
        .unwrap();
    registry.register_tool(SoftFailTool, RegisterOptions::new()).unwrap();
    registry.register_tool(BigOutput, RegisterOptions::new()).unwrap();
    registry
        .register_tool(AdminOnly, RegisterOptions::new().requires(Permission::Admin))
        .unwrap();
    registry
}

fn engine(provider: &Arc<MockProvider>) -> ConversationEngine {
    ConversationEngine::new(Arc::clone(provider), registry(), EngineConfig::new("mock-model"))
}

fn member() -> TurnOptions {
    TurnOptions::new(Caller::new("user-1", AccessLevel::Member))
}

async fn drain(mut rx: mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn internal_count(engine: &ConversationEngine) -> usize {
    engine
        .conversation()
        .active_messages()
        .iter()
        .filter(|m| m.internal)
        .count()
}

// --- Pre-tool correction loop ---

#[tokio::test]
async fn empty_replies_exhaust_corrections() {
    let provider = MockProvider::new(vec![empty_reply(), empty_reply(), empty_reply()]);
    let mut engine = engine(&provider);

    let outcome = engine.process_turn("hello", member()).await.unwrap();

    assert_eq!(outcome.content, FAILURE_MESSAGE);
    assert_eq!(outcome.status, TurnStatus::CorrectionExhausted);
    assert!(outcome.tool_calls.is_empty());
    assert_eq!(provider.requests().await.len(), 3);
    // one correction pair per retry, none after the last attempt
    assert_eq!(internal_count(&engine), 4);
    let messages = engine.conversation().active_messages();
    assert_eq!(messages.len(), 5);
    assert!(!messages.iter().any(|m| m.content == FAILURE_MESSAGE));
}

#[tokio::test]
async fn parse_error_then_recovery() {
    let provider = MockProvider::new(vec![empty_reply(), text_reply("Hi there.")]);
    let mut engine = engine(&provider);
    let (tx, rx) = mpsc::channel(32);

    let outcome = engine
        .process_turn("hello", member().with_events(tx))
        .await
        .unwrap();

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.content, "Hi there.");
    assert_eq!(outcome.usage.total_tokens, 15);
    let events = drain(rx).await;
    assert_eq!(
        events,
        vec![
            TurnEvent::Correction {
                reason: "parse_error".into()
            },
            TurnEvent::AssistantMessage {
                content: "Hi there.".into()
            },
            TurnEvent::Finished {
                status: TurnStatus::Completed,
                iterations: 0
            },
        ]
    );
    // the second request saw the correction pair
    let requests = provider.requests().await;
    let last = requests[1].messages.last().unwrap();
    assert_eq!(last.role, Role::System);
}

#[tokio::test]
async fn persistent_tool_call_failure_falls_back_without_tools() {
    let provider = MockProvider::with_results(vec![
        Err(tool_use_failed()),
        Err(tool_use_failed()),
        Err(tool_use_failed()),
        Ok(text_reply("I could not list the documents, but here is what I know.")),
    ]);
    let mut engine = engine(&provider);

    let outcome = engine.process_turn("list items", member()).await.unwrap();

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert!(outcome.content.starts_with("I could not list"));
    let requests = provider.requests().await;
    assert_eq!(requests.len(), 4);
    assert!(!requests[0].tools.is_empty());
    assert!(requests[3].tools.is_empty());
    assert_eq!(requests[3].tool_choice, ToolChoice::None);
    // corrections name the tool recovered from the provider metadata
    assert!(engine
        .conversation()
        .active_messages()
        .iter()
        .any(|m| m.internal && m.content.contains("list_documents")));
}

#[tokio::test]
async fn fallback_that_still_calls_tools_collapses_to_failure() {
    let provider = MockProvider::with_results(vec![
        Err(tool_use_failed()),
        Err(tool_use_failed()),
        Err(tool_use_failed()),
        Ok(tool_reply(&[("c1", "list_documents", json!({"type": "Item"}))])),
    ]);
    let mut engine = engine(&provider);

    let outcome = engine.process_turn("list items", member()).await.unwrap();

    assert_eq!(outcome.status, TurnStatus::ToolsDisabledFallback);
    assert_eq!(outcome.content, FAILURE_MESSAGE);
    assert_eq!(provider.requests().await.len(), 4);
}

#[tokio::test]
async fn transport_errors_surface() {
    let provider = MockProvider::with_results(vec![Err(InferenceError::ApiError {
        status: 401,
        body: "unauthorized".into(),
    })]);
    let mut engine = engine(&provider);

    let err = engine.process_turn("hello", member()).await.unwrap_err();
    assert!(matches!(
        err,
        AgentError::Inference(InferenceError::ApiError { status: 401, .. })
    ));
}

// --- Agentic loop ---

#[tokio::test]
async fn single_tool_call_then_answer() {
    let provider = MockProvider::new(vec![
        tool_reply(&[(
            "call_1",
            "list_documents",
            json!({"type": "Item", "justification": "user asked for items"}),
        )]),
        text_reply("You have two items."),
    ]);
    let mut engine = engine(&provider);
    let (tx, rx) = mpsc::channel(32);

    let outcome = engine
        .process_turn("what items do I have?", member().with_events(tx))
        .await
        .unwrap();

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.content, "You have two items.");
    assert!(outcome.tool_calls.is_empty());
    assert_eq!(outcome.iterations, 1);
    assert_eq!(outcome.repeats, 0);
    assert_eq!(outcome.usage.total_tokens, 30);

    let messages = engine.conversation().active_messages();
    let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
    assert_eq!(messages[2].tool_call_id.as_deref(), Some("call_1"));
    assert!(messages[2].content.contains("d1"));

    // the follow-up request carries the tool output
    let requests = provider.requests().await;
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].messages.last().unwrap().role, Role::Tool);

    let events = drain(rx).await;
    assert!(matches!(&events[0], TurnEvent::ToolCall { name, .. } if name == "list_documents"));
    assert!(matches!(&events[1], TurnEvent::ToolResult { is_error: false, .. }));
    assert_eq!(
        events[2],
        TurnEvent::AssistantMessage {
            content: "You have two items.".into()
        }
    );
    assert!(matches!(
        events[3],
        TurnEvent::Finished {
            status: TurnStatus::Completed,
            iterations: 1
        }
    ));
    assert_eq!(engine.registry().stats("list_documents").unwrap().success_count, 1);
}

#[tokio::test]
async fn failing_call_in_batch_keeps_order_and_parity() {
    let provider = MockProvider::new(vec![
        tool_reply(&[
            ("c1", "list_documents", json!({"type": "Item"})),
            ("c2", "update_document", json!({"id": "d1"})),
            ("c3", "list_documents", json!({"type": "Actor"})),
        ]),
        text_reply("One update failed."),
    ]);
    let mut engine = engine(&provider);

    let outcome = engine.process_turn("update things", member()).await.unwrap();

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.repeats, 1);
    let tool_messages: Vec<&Message> = engine
        .conversation()
        .active_messages()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .collect();
    assert_eq!(tool_messages.len(), 3);
    let ids: Vec<&str> = tool_messages
        .iter()
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    assert_eq!(ids, vec!["c1", "c2", "c3"]);
    let failed: Value = serde_json::from_str(&tool_messages[1].content).unwrap();
    assert!(failed["error"].as_str().unwrap().contains("document is locked"));
    assert!(!tool_messages[2].content.contains("error"));
    assert!(has_parity(engine.conversation().active_messages()));
}

#[tokio::test]
async fn repeated_failures_hit_the_tool_limit() {
    let failing = || tool_reply(&[("c", "update_document", json!({"id": "d1"}))]);
    let provider = MockProvider::new((0..5).map(|_| failing()).collect());
    let mut engine = engine(&provider);

    let outcome = engine.process_turn("update d1", member()).await.unwrap();

    assert_eq!(outcome.status, TurnStatus::ToolLimitReached);
    assert!(outcome.tool_limit_reached());
    assert!(outcome.tool_calls.is_empty());
    assert_eq!(outcome.content, TOOL_LIMIT_MESSAGE);
    assert_eq!(outcome.repeats, 5);
    assert_eq!(outcome.iterations, 5);
    assert_eq!(provider.requests().await.len(), 5);

    // the ending notice is the last thing in history
    let messages = engine.conversation().active_messages();
    let notice = &messages[messages.len() - 1];
    assert_eq!(notice.role, Role::System);
    assert!(notice.internal);
    assert!(notice.content.contains("Do not call any more tools"));
    assert_eq!(engine.registry().stats("update_document").unwrap().failure_count, 5);
}

#[tokio::test]
async fn soft_errors_count_as_failures() {
    let provider = MockProvider::new(vec![
        tool_reply(&[("c1", "read_document", json!({"id": "missing"}))]),
        text_reply("That document does not exist."),
    ]);
    let mut engine = engine(&provider);

    let outcome = engine.process_turn("read missing", member()).await.unwrap();

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.repeats, 1);
}

#[tokio::test]
async fn permission_denied_is_a_failed_result() {
    let provider = MockProvider::new(vec![
        tool_reply(&[("c1", "delete_world", json!({}))]),
        text_reply("I am not allowed to do that."),
    ]);
    let mut engine = engine(&provider);

    let outcome = engine.process_turn("delete everything", member()).await.unwrap();

    assert_eq!(outcome.content, "I am not allowed to do that.");
    let tool = engine
        .conversation()
        .active_messages()
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    assert!(tool.content.contains("error"));
    assert_eq!(engine.registry().stats("delete_world").unwrap().execution_count, 0);
}

#[tokio::test]
async fn identical_calls_trip_the_loop_guard() {
    let call = |id: &str, why: &str| {
        tool_reply(&[(
            id,
            "list_documents",
            json!({"type": "Item", "justification": why}),
        )])
    };
    let provider = MockProvider::new(vec![
        call("c1", "first look"),
        call("c2", "checking again"),
        call("c3", "one more time"),
        call("c4", "just to be sure"),
    ]);
    let mut engine = engine(&provider);

    let outcome = engine.process_turn("list items", member()).await.unwrap();

    assert_eq!(outcome.status, TurnStatus::LoopGuardTripped);
    assert!(outcome.tool_limit_reached());
    assert_eq!(outcome.iterations, 4);
    assert_eq!(outcome.repeats, 0);
    assert_eq!(engine.registry().stats("list_documents").unwrap().execution_count, 3);

    let messages = engine.conversation().active_messages();
    let skipped = messages
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("c4"))
        .unwrap();
    assert!(skipped.content.contains("Skipped"));
    assert!(has_parity(messages));
}

#[tokio::test]
async fn iteration_cap_ends_the_turn() {
    let provider = MockProvider::new(vec![
        tool_reply(&[("c1", "list_documents", json!({"type": "A"}))]),
        tool_reply(&[("c2", "list_documents", json!({"type": "B"}))]),
        tool_reply(&[("c3", "list_documents", json!({"type": "C"}))]),
    ]);
    let mut engine = ConversationEngine::new(
        Arc::clone(&provider),
        registry(),
        EngineConfig::new("mock-model").with_max_iterations(2),
    );

    let outcome = engine.process_turn("list everything", member()).await.unwrap();

    assert_eq!(outcome.status, TurnStatus::LoopGuardTripped);
    assert_eq!(outcome.iterations, 3);
    assert_eq!(engine.registry().stats("list_documents").unwrap().execution_count, 2);
    assert!(has_parity(engine.conversation().active_messages()));
}

#[tokio::test]
async fn unparseable_replies_after_tools_use_the_repeat_budget() {
    let mut replies = vec![tool_reply(&[("c1", "list_documents", json!({"type": "Item"}))])];
    replies.extend((0..5).map(|_| empty_reply()));
    let provider = MockProvider::new(replies);
    let mut engine = engine(&provider);

    let outcome = engine.process_turn("list items", member()).await.unwrap();

    assert_eq!(outcome.status, TurnStatus::ToolLimitReached);
    assert_eq!(outcome.content, TOOL_LIMIT_MESSAGE);
    assert_eq!(outcome.repeats, 5);
    assert_eq!(outcome.iterations, 1);
    assert_eq!(provider.requests().await.len(), 6);
    assert!(has_parity(engine.conversation().active_messages()));
}

#[tokio::test]
async fn malformed_call_after_tools_is_corrected_in_loop() {
    let provider = MockProvider::with_results(vec![
        Ok(tool_reply(&[("c1", "list_documents", json!({"type": "Item"}))])),
        Err(tool_use_failed()),
        Ok(text_reply("Listed.")),
    ]);
    let mut engine = engine(&provider);
    let (tx, rx) = mpsc::channel(32);

    let outcome = engine
        .process_turn("list items", member().with_events(tx))
        .await
        .unwrap();

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.content, "Listed.");
    assert_eq!(outcome.repeats, 1);
    assert_eq!(provider.requests().await.len(), 3);
    let events = drain(rx).await;
    assert!(events.contains(&TurnEvent::Correction {
        reason: "tool_call_failure".into()
    }));
    // the correction names the tool from the provider metadata
    assert!(engine
        .conversation()
        .active_messages()
        .iter()
        .any(|m| m.internal && m.content.contains("list_documents")));
    assert!(has_parity(engine.conversation().active_messages()));
}

#[tokio::test]
async fn oversized_output_is_buffered_and_readable() {
    let provider = MockProvider::new(vec![
        tool_reply(&[("log1", "dump_log", json!({}))]),
        tool_reply(&[(
            "r1",
            "read_tool_output",
            json!({"tool_call_id": "log1", "start_line": 10, "end_line": 12, "justification": "need detail"}),
        )]),
        text_reply("Lines 10 to 12 look normal."),
    ]);
    let mut engine = ConversationEngine::new(
        Arc::clone(&provider),
        registry(),
        EngineConfig::new("mock-model").with_tool_output_inline_limit(500),
    );

    let outcome = engine.process_turn("check the log", member()).await.unwrap();
    assert_eq!(outcome.status, TurnStatus::Completed);

    let conversation = engine.conversation();
    assert!(conversation.has_tool_output("log1"));
    let messages = conversation.active_messages();
    let preview = messages
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("log1"))
        .unwrap();
    assert!(preview.content.starts_with("line 1\n"));
    assert!(preview.content.contains("of 200 lines"));
    assert!(preview.content.contains("read_tool_output"));
    assert!(preview.content.len() < 600);

    let read = messages
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("r1"))
        .unwrap();
    assert_eq!(read.content, "Lines 10-12 of 200:\nline 10\nline 11\nline 12");

    // the reader is only offered once something is buffered
    let requests = provider.requests().await;
    let offered = |r: &InferenceRequest| {
        r.tools
            .iter()
            .any(|t| t["function"]["name"] == "read_tool_output")
    };
    assert!(!offered(&requests[0]));
    assert!(offered(&requests[1]));
}

#[tokio::test]
async fn gemini_replies_drive_the_loop() {
    let provider = MockProvider::new(vec![
        json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"functionCall": {"name": "list_documents", "args": {"type": "Item"}}, "thoughtSignature": "sig-a"}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 8, "candidatesTokenCount": 2, "totalTokenCount": 10},
            "modelVersion": "gemini-test"
        }),
        json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Two items."}]},
                "finishReason": "STOP"
            }],
            "modelVersion": "gemini-test"
        }),
    ]);
    let mut engine = engine(&provider);

    let outcome = engine.process_turn("items?", member()).await.unwrap();

    assert_eq!(outcome.content, "Two items.");
    assert_eq!(outcome.model.as_deref(), Some("gemini-test"));
    let call_message = &engine.conversation().active_messages()[1];
    let call_id = &call_message.tool_calls[0].id;
    assert_eq!(
        call_message.provider_metadata["thought_signatures"][call_id.as_str()],
        "sig-a"
    );
}

// --- Cancellation ---

#[tokio::test]
async fn cancelled_token_stops_before_any_request() {
    let provider = MockProvider::new(vec![text_reply("never sent")]);
    let mut engine = engine(&provider);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = engine
        .process_turn("hello", member().with_cancel(cancel))
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::Cancelled));
    assert!(provider.requests().await.is_empty());
}

#[tokio::test]
async fn canceller_aborts_in_flight_request() {
    let mut engine =
        ConversationEngine::new(StallingProvider, registry(), EngineConfig::new("mock-model"));
    let canceller = engine.canceller();
    assert!(!canceller.cancel_current());

    let trigger = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        canceller.cancel_current()
    });

    let err = engine.process_turn("hello", member()).await.unwrap_err();
    assert!(matches!(err, AgentError::Cancelled));
    assert!(trigger.await.unwrap());
    assert!(!engine.canceller().cancel_current());
}

// --- Context and persistence ---

#[tokio::test]
async fn compaction_folds_oldest_chunk_into_summary() {
    let provider = MockProvider::new(vec![
        text_reply("The user and assistant discussed lorem ipsum."),
        text_reply("Sure."),
    ]);
    let config = EngineConfig::new("mock-model").with_compaction(
        CompactionConfig::default()
            .with_max_tokens(200)
            .with_reserved_overhead(0)
            .with_chunk_size(5),
    );
    let mut engine = ConversationEngine::new(Arc::clone(&provider), registry(), config);
    let filler = "lorem ipsum dolor sit amet ".repeat(4);
    for i in 0..10 {
        let message = if i % 2 == 0 {
            Message::user(filler.clone())
        } else {
            Message::assistant(filler.clone())
        };
        engine.conversation_mut().add_message(message);
    }
    let (tx, rx) = mpsc::channel(32);

    let outcome = engine
        .process_turn("and now?", member().with_events(tx))
        .await
        .unwrap();

    assert_eq!(outcome.content, "Sure.");
    let conversation = engine.conversation();
    assert_eq!(
        conversation.rolling_summary(),
        "The user and assistant discussed lorem ipsum."
    );
    // 10 seeded + user + reply, minus the 5 folded away
    assert_eq!(conversation.active_messages().len(), 7);

    let requests = provider.requests().await;
    assert!(requests[0].tools.is_empty());
    assert_eq!(requests[0].tool_choice, ToolChoice::None);
    assert!(requests[1].messages[0].content.contains("discussed lorem ipsum"));

    let events = drain(rx).await;
    let compacted = events
        .iter()
        .find_map(|e| match e {
            TurnEvent::Compacted {
                pre_tokens,
                post_tokens,
            } => Some((*pre_tokens, *post_tokens)),
            _ => None,
        })
        .unwrap();
    assert!(compacted.1 < compacted.0);
}

#[tokio::test]
async fn failed_compaction_is_not_retried_in_the_same_turn() {
    let provider = MockProvider::with_results(vec![
        Err(InferenceError::Request("summarizer unavailable".into())),
        Ok(tool_reply(&[("c1", "list_documents", json!({"type": "A"}))])),
        Ok(tool_reply(&[("c2", "list_documents", json!({"type": "B"}))])),
        Ok(text_reply("Done.")),
    ]);
    let config = EngineConfig::new("mock-model").with_compaction(
        CompactionConfig::default()
            .with_max_tokens(200)
            .with_reserved_overhead(0)
            .with_chunk_size(5),
    );
    let mut engine = ConversationEngine::new(Arc::clone(&provider), registry(), config);
    let filler = "lorem ipsum dolor sit amet ".repeat(4);
    for i in 0..10 {
        let message = if i % 2 == 0 {
            Message::user(filler.clone())
        } else {
            Message::assistant(filler.clone())
        };
        engine.conversation_mut().add_message(message);
    }

    let outcome = engine.process_turn("list A then B", member()).await.unwrap();

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.content, "Done.");
    assert_eq!(outcome.iterations, 2);
    let requests = provider.requests().await;
    assert_eq!(requests.len(), 4);
    let summary_requests = requests
        .iter()
        .filter(|r| r.tools.is_empty() && r.tool_choice == ToolChoice::None)
        .count();
    assert_eq!(summary_requests, 1);
    assert!(engine.conversation().rolling_summary().is_empty());
}

#[tokio::test]
async fn broken_parity_is_repaired_on_load() {
    let store = InMemoryStore::new();
    let key = ConversationKey::new("user-1", "world-1");
    let stored = ConversationState {
        active_messages: vec![
            Message::user("update both"),
            Message::assistant_with_tools(
                "",
                vec![
                    toolloop::ToolCall::new("a", "update_document", json!({"id": 1})),
                    toolloop::ToolCall::new("b", "update_document", json!({"id": 2})),
                ],
            ),
            Message::tool_result("a", "{\"ok\":true}"),
            Message::tool_result("zzz", "orphan"),
            Message::assistant("done"),
        ],
        ..Default::default()
    };
    store
        .set(&key, serde_json::to_value(&stored).unwrap())
        .await
        .unwrap();

    let provider = MockProvider::new(vec![text_reply("Welcome back.")]);
    let mut engine = engine(&provider);
    assert!(engine.load(&store, &key).await.unwrap());

    let messages = engine.conversation().active_messages();
    assert!(has_parity(messages));
    assert!(messages.iter().all(|m| m.tool_call_id.as_deref() != Some("zzz")));
    assert!(messages
        .iter()
        .any(|m| m.tool_call_id.as_deref() == Some("b") && m.content.contains("interrupted")));

    // a turn after the repair sends a well-formed history
    engine.process_turn("hi again", member()).await.unwrap();
    let requests = provider.requests().await;
    assert!(has_parity(&requests[0].messages));
}

#[tokio::test]
async fn persister_writes_every_change() {
    let store = Arc::new(InMemoryStore::new());
    let key = ConversationKey::new("user-1", "world-9");
    let (hook, handle) = spawn_persister(store.clone(), key.clone());

    let provider = MockProvider::new(vec![
        tool_reply(&[("c1", "list_documents", json!({"type": "Item"}))]),
        text_reply("Listed."),
    ]);
    let mut engine = engine(&provider).with_state_hook(hook);
    engine.process_turn("list", member()).await.unwrap();
    drop(engine);
    handle.await.unwrap();

    let saved = store.get(&key).await.unwrap().unwrap();
    let state = ConversationState::from_stored(saved).unwrap();
    assert_eq!(state.active_messages.len(), 4);
    assert_eq!(state.active_messages[3].content, "Listed.");

    // and the saved state loads into a fresh engine
    let mut restored = ConversationEngine::new(
        MockProvider::new(vec![]),
        registry(),
        EngineConfig::new("mock-model"),
    );
    assert!(restored.load(store.as_ref(), &key).await.unwrap());
    assert_eq!(restored.conversation().active_messages().len(), 4);
}

#[tokio::test]
async fn system_prompt_leads_every_request() {
    let provider = MockProvider::new(vec![text_reply("ok")]);
    let mut engine = ConversationEngine::new(
        Arc::clone(&provider),
        registry(),
        EngineConfig::new("mock-model").with_system_prompt("You manage a document store."),
    );

    engine.process_turn("hi", member()).await.unwrap();

    let requests = provider.requests().await;
    let first = &requests[0].messages[0];
    assert_eq!(first.role, Role::System);
    assert_eq!(first.content, "You manage a document store.");
    assert_eq!(requests[0].model, "mock-model");
}

// --- Engine surface ---

#[tokio::test]
async fn with_retries_rides_out_transient_errors() {
    let provider = MockProvider::with_results(vec![
        Err(InferenceError::ApiError {
            status: 503,
            body: "overloaded".into(),
        }),
        Ok(text_reply("Back online.")),
    ]);
    let config = EngineConfig::new("mock-model").with_retry(RetryConfig {
        max_retries: 3,
        min_delay_ms: 1,
        max_delay_ms: 2,
        factor: 2.0,
        jitter: false,
    });
    let mut engine = ConversationEngine::with_retries(Arc::clone(&provider), registry(), config);

    let outcome = engine.process_turn("hello", member()).await.unwrap();

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.content, "Back online.");
    assert_eq!(provider.requests().await.len(), 2);
}

#[tokio::test]
async fn plain_engine_surfaces_transient_errors() {
    let provider = MockProvider::with_results(vec![
        Err(InferenceError::ApiError {
            status: 503,
            body: "overloaded".into(),
        }),
        Ok(text_reply("Back online.")),
    ]);
    let mut engine = engine(&provider);

    let result = engine.process_turn("hello", member()).await;

    assert!(matches!(result, Err(AgentError::Inference(_))));
    assert_eq!(provider.requests().await.len(), 1);
}

#[tokio::test]
async fn registering_on_the_engine_reports_registry_errors() {
    let provider = MockProvider::new(vec![
        tool_reply(&[("c1", "current_note", json!({}))]),
        text_reply("Noted."),
    ]);
    let mut engine = engine(&provider);

    let duplicate = engine.register_tool(ListDocuments, RegisterOptions::new());
    assert!(matches!(
        duplicate,
        Err(AgentError::Registry(RegistryError::Duplicate(ref name))) if name == "list_documents"
    ));

    engine
        .register_tool(CurrentNote, RegisterOptions::new().category("notes"))
        .unwrap();
    let outcome = engine.process_turn("what is the note?", member()).await.unwrap();

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(engine.registry().stats("current_note").unwrap().execution_count, 1);
    let requests = provider.requests().await;
    assert!(requests[0].tools.iter().any(|t| t.to_string().contains("current_note")));
}

struct CurrentNote;

#[async_trait]
impl Tool for CurrentNote {
    fn name(&self) -> &str {
        "current_note"
    }

    fn description(&self) -> &str {
        "Read the pinned note"
    }

    async fn execute(&self, _args: &Value) -> Result<Value, String> {
        Ok(json!({"note": "buy milk"}))
    }
}

#[tokio::test]
async fn reasoning_spans_are_stripped_from_replies() {
    let raw = "<think>The user wants a greeting.</think>Hello!";
    let provider = MockProvider::new(vec![text_reply(raw)]);
    let mut engine = engine(&provider);

    let outcome = engine.process_turn("hi", member()).await.unwrap();

    assert_eq!(outcome.content, strip_think(raw));
    assert_eq!(outcome.content, "Hello!");
    let last = engine.conversation().active_messages().last().unwrap();
    assert_eq!(last.content, "Hello!");
}
