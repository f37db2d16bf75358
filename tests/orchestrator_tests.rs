//! Session state machine and turn-loop tests with scripted collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatbridge::catalog::ToolCatalog;
use chatbridge::executor::{ToolInvoker, ToolOutcome};
use chatbridge::invoker::{InvokeError, ModelInvoker, ToolCallRequest};
use chatbridge::{
    BridgeConfig, BusyPolicy, ChannelSink, LlmPipeline, ServerFrame, Session, SessionOrchestrator,
    SessionPhase,
};
use serde_json::{json, Value};
use tokio::sync::Mutex;

/// Invoker that pops scripted replies, in order.
struct ScriptedInvoker {
    script: Mutex<Vec<Result<Value, InvokeError>>>,
}

impl ScriptedInvoker {
    fn new(mut script: Vec<Result<Value, InvokeError>>) -> Arc<Self> {
        script.reverse();
        Arc::new(Self {
            script: Mutex::new(script),
        })
    }
}

#[async_trait]
impl ModelInvoker for ScriptedInvoker {
    async fn invoke(&self, _model_id: &str, _body: Value) -> Result<Value, InvokeError> {
        self.script
            .lock()
            .await
            .pop()
            .unwrap_or(Err(InvokeError::Fatal("script exhausted".into())))
    }
}

/// Invoker that blocks until released, for busy-policy tests.
struct BlockingInvoker {
    release: tokio::sync::Notify,
}

#[async_trait]
impl ModelInvoker for BlockingInvoker {
    async fn invoke(&self, _model_id: &str, _body: Value) -> Result<Value, InvokeError> {
        self.release.notified().await;
        Ok(claude_text("done waiting"))
    }
}

/// Tool invoker recording calls and answering from a closure.
struct RecordingTools {
    calls: Mutex<Vec<ToolCallRequest>>,
    executed: AtomicUsize,
}

impl RecordingTools {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            executed: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ToolInvoker for RecordingTools {
    async fn execute(&self, call: &ToolCallRequest) -> ToolOutcome {
        self.calls.lock().await.push(call.clone());
        self.executed.fetch_add(1, Ordering::SeqCst);
        ToolOutcome {
            tool_use_id: call.id.clone(),
            name: call.name.clone(),
            content: format!("result-for-{}", call.name),
            is_error: false,
            status: Some(200),
        }
    }
}

/// Sink collecting every outbound frame.
#[derive(Default)]
struct RecordingSink {
    frames: Mutex<Vec<ServerFrame>>,
}

impl RecordingSink {
    async fn frames(&self) -> Vec<ServerFrame> {
        self.frames.lock().await.clone()
    }

    async fn last_ai_response(&self) -> Option<(String, Option<Value>, Option<Value>)> {
        self.frames
            .lock()
            .await
            .iter()
            .rev()
            .find_map(|f| match f {
                ServerFrame::AiResponse {
                    message,
                    tool_calls,
                    tool_results,
                    ..
                } => Some((message.clone(), tool_calls.clone(), tool_results.clone())),
                _ => None,
            })
    }
}

#[async_trait]
impl ChannelSink for RecordingSink {
    async fn send(
        &self,
        frame: ServerFrame,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.frames.lock().await.push(frame);
        Ok(())
    }
}

fn claude_text(text: &str) -> Value {
    json!({"content": [{"type": "text", "text": text}]})
}

fn claude_tool_use(id: &str, name: &str, input: Value) -> Value {
    json!({"content": [
        {"type": "text", "text": "let me check"},
        {"type": "tool_use", "id": id, "name": name, "input": input},
    ]})
}

fn build(
    config: BridgeConfig,
    invoker: Arc<dyn ModelInvoker>,
    tools: Arc<dyn ToolInvoker>,
) -> SessionOrchestrator {
    let config = Arc::new(config);
    let session = Arc::new(Session::new(&config));
    let pipeline = Arc::new(LlmPipeline::new(invoker, config.clone()));
    let catalog = Arc::new(ToolCatalog::new("http://localhost:8000"));
    SessionOrchestrator::new(session, pipeline, tools, catalog, config)
}

fn fast_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.retry_base_delay = Duration::from_millis(1);
    config.rate_refill_interval = Duration::from_millis(1);
    config.rate_bucket_capacity = 1000;
    config
}

#[tokio::test]
async fn ping_pong_and_unknown_type() {
    let orchestrator = build(
        fast_config(),
        ScriptedInvoker::new(vec![]),
        RecordingTools::new(),
    );
    let sink = RecordingSink::default();

    orchestrator.handle_frame(r#"{"type":"ping"}"#, &sink).await;
    orchestrator.handle_frame(r#"{"type":"disco"}"#, &sink).await;
    orchestrator.handle_frame("not json", &sink).await;

    let frames = sink.frames().await;
    assert!(matches!(frames[0], ServerFrame::Pong { .. }));
    assert!(matches!(frames[1], ServerFrame::Error { .. }));
    assert!(matches!(frames[2], ServerFrame::Error { .. }));
    // protocol errors are non-fatal: the session stays open
    assert_eq!(orchestrator.phase().await, SessionPhase::OpenUnauth);
}

#[tokio::test]
async fn auth_transitions_phase_and_logout_reverts() {
    let orchestrator = build(
        fast_config(),
        ScriptedInvoker::new(vec![]),
        RecordingTools::new(),
    );
    let sink = RecordingSink::default();
    assert_eq!(orchestrator.phase().await, SessionPhase::OpenUnauth);

    orchestrator
        .handle_frame(
            r#"{"type":"auth","auth_type":"bearer_token","token":"T"}"#,
            &sink,
        )
        .await;
    assert_eq!(orchestrator.phase().await, SessionPhase::OpenAuth);
    assert!(matches!(
        sink.frames().await[0],
        ServerFrame::AuthConfigured { .. }
    ));

    orchestrator.handle_frame(r#"{"type":"logout"}"#, &sink).await;
    assert_eq!(orchestrator.phase().await, SessionPhase::OpenUnauth);
    assert!(!orchestrator.session().credentials.is_configured().await);
}

#[tokio::test]
async fn bad_auth_yields_auth_failed_session_usable() {
    let orchestrator = build(
        fast_config(),
        ScriptedInvoker::new(vec![Ok(claude_text("hello"))]),
        RecordingTools::new(),
    );
    let sink = RecordingSink::default();

    orchestrator
        .handle_frame(r#"{"type":"auth","auth_type":"bearer_token"}"#, &sink)
        .await;
    assert!(matches!(
        sink.frames().await[0],
        ServerFrame::AuthFailed { .. }
    ));
    assert_eq!(orchestrator.phase().await, SessionPhase::OpenUnauth);

    // chat still works without credentials when auth is optional
    orchestrator
        .handle_frame(r#"{"type":"chat","message":"hi"}"#, &sink)
        .await;
    assert_eq!(sink.last_ai_response().await.unwrap().0, "hello");
}

#[tokio::test]
async fn require_tool_auth_rejects_unauthenticated_chat() {
    let mut config = fast_config();
    config.require_tool_auth = true;
    let orchestrator = build(
        config,
        ScriptedInvoker::new(vec![Ok(claude_text("never"))]),
        RecordingTools::new(),
    );
    let sink = RecordingSink::default();

    orchestrator
        .handle_frame(r#"{"type":"chat","message":"hi"}"#, &sink)
        .await;

    let frames = sink.frames().await;
    assert!(matches!(frames[0], ServerFrame::AuthFailed { .. }));
    assert!(sink.last_ai_response().await.is_none());
}

#[tokio::test]
async fn simple_turn_appends_history_and_replies() {
    let orchestrator = build(
        fast_config(),
        ScriptedInvoker::new(vec![Ok(claude_text("The answer is 4."))]),
        RecordingTools::new(),
    );
    let sink = RecordingSink::default();

    orchestrator
        .handle_frame(r#"{"type":"chat","message":"2+2?"}"#, &sink)
        .await;

    let (message, calls, results) = sink.last_ai_response().await.unwrap();
    assert_eq!(message, "The answer is 4.");
    assert!(calls.is_none());
    assert!(results.is_none());

    let history = orchestrator.session().history().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].text(), "2+2?");
    assert_eq!(history[1].text(), "The answer is 4.");

    // typing=false precedes the ai_response
    let frames = sink.frames().await;
    let typing_false = frames
        .iter()
        .position(|f| matches!(f, ServerFrame::Typing { typing: false, .. }))
        .unwrap();
    let ai = frames
        .iter()
        .position(|f| matches!(f, ServerFrame::AiResponse { .. }))
        .unwrap();
    assert!(typing_false < ai);
}

#[tokio::test]
async fn tool_round_pairs_use_and_result_before_next_dispatch() {
    let invoker = ScriptedInvoker::new(vec![
        Ok(claude_tool_use("u1", "get_users", json!({"limit": 5}))),
        Ok(claude_text("5 users found.")),
    ]);
    let tools = RecordingTools::new();
    let orchestrator = build(fast_config(), invoker, tools.clone());
    let sink = RecordingSink::default();

    orchestrator
        .handle_frame(r#"{"type":"chat","message":"list 5 users"}"#, &sink)
        .await;

    // the tool was executed with the model's arguments
    let calls = tools.calls.lock().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, "get_users");
    assert_eq!(calls[0].arguments, json!({"limit": 5}));
    drop(calls);

    // history: user, assistant(tool_use u1), tool_result(u1), assistant final
    let history = orchestrator.session().history().await;
    assert_eq!(history.len(), 4);
    assert_eq!(history[1].tool_use_ids(), vec!["u1"]);
    assert_eq!(history[2].tool_result_refs(), vec!["u1"]);
    assert_eq!(history[3].text(), "5 users found.");

    let (message, calls, results) = sink.last_ai_response().await.unwrap();
    assert_eq!(message, "5 users found.");
    assert_eq!(calls.unwrap().as_array().unwrap().len(), 1);
    let results = results.unwrap();
    assert_eq!(results[0]["result"], "result-for-get_users");
}

#[tokio::test]
async fn multi_round_loop_runs_until_terminal_reply() {
    let invoker = ScriptedInvoker::new(vec![
        Ok(claude_tool_use("u1", "get_users", json!({}))),
        Ok(claude_tool_use("u2", "get_posts", json!({}))),
        Ok(claude_text("all done")),
    ]);
    let tools = RecordingTools::new();
    let orchestrator = build(fast_config(), invoker, tools.clone());
    let sink = RecordingSink::default();

    orchestrator
        .handle_frame(r#"{"type":"chat","message":"go"}"#, &sink)
        .await;

    assert_eq!(tools.executed.load(Ordering::SeqCst), 2);
    assert_eq!(sink.last_ai_response().await.unwrap().0, "all done");

    // every tool_use in history has its result (pair integrity end to end)
    let history = orchestrator.session().history().await;
    let uses: Vec<String> = history
        .iter()
        .flat_map(|m| m.tool_use_ids())
        .map(String::from)
        .collect();
    let refs: Vec<String> = history
        .iter()
        .flat_map(|m| m.tool_result_refs())
        .map(String::from)
        .collect();
    assert_eq!(uses, vec!["u1", "u2"]);
    assert_eq!(refs, vec!["u1", "u2"]);
}

#[tokio::test]
async fn tool_call_budget_exhaustion_is_terminal_not_fatal() {
    let mut config = fast_config();
    config.max_tool_calls = 2;
    let invoker = ScriptedInvoker::new(vec![
        Ok(claude_tool_use("u1", "get_users", json!({}))),
        Ok(claude_tool_use("u2", "get_users", json!({}))),
        Ok(claude_tool_use("u3", "get_users", json!({}))),
        Ok(claude_text("unreachable")),
    ]);
    let tools = RecordingTools::new();
    let orchestrator = build(config, invoker, tools.clone());
    let sink = RecordingSink::default();

    orchestrator
        .handle_frame(r#"{"type":"chat","message":"go"}"#, &sink)
        .await;

    // two rounds executed, the third tripped the budget
    assert_eq!(tools.executed.load(Ordering::SeqCst), 2);
    let (message, _, _) = sink.last_ai_response().await.unwrap();
    assert!(message.contains("tool-call budget exhausted"));

    // budget stop leaves history consistent
    let history = orchestrator.session().history().await;
    let uses: Vec<String> = history
        .iter()
        .flat_map(|m| m.tool_use_ids())
        .map(String::from)
        .collect();
    let refs: Vec<String> = history
        .iter()
        .flat_map(|m| m.tool_result_refs())
        .map(String::from)
        .collect();
    assert_eq!(uses, refs);
    assert_eq!(orchestrator.phase().await, SessionPhase::OpenUnauth);
}

#[tokio::test]
async fn fatal_model_error_surfaces_as_ai_response() {
    let invoker = ScriptedInvoker::new(vec![Err(InvokeError::Fatal("bad request".into()))]);
    let orchestrator = build(fast_config(), invoker, RecordingTools::new());
    let sink = RecordingSink::default();

    orchestrator
        .handle_frame(r#"{"type":"chat","message":"hi"}"#, &sink)
        .await;

    let (message, _, _) = sink.last_ai_response().await.unwrap();
    assert!(message.contains("bad request"));
    assert_eq!(orchestrator.phase().await, SessionPhase::OpenUnauth);
}

#[tokio::test]
async fn busy_reject_policy_rejects_overlapping_chat() {
    let invoker = Arc::new(BlockingInvoker {
        release: tokio::sync::Notify::new(),
    });
    let mut config = fast_config();
    config.busy_policy = BusyPolicy::Reject;

    let orchestrator = Arc::new(build(config, invoker.clone(), RecordingTools::new()));
    let sink = Arc::new(RecordingSink::default());

    let first = {
        let orchestrator = orchestrator.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            orchestrator
                .handle_frame(r#"{"type":"chat","message":"first"}"#, sink.as_ref())
                .await;
        })
    };

    // wait for the first turn to take the gate
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(orchestrator.phase().await, SessionPhase::Processing);

    orchestrator
        .handle_frame(r#"{"type":"chat","message":"second"}"#, sink.as_ref())
        .await;
    let busy = sink
        .frames()
        .await
        .iter()
        .any(|f| matches!(f, ServerFrame::Error { message, .. } if message.contains("busy")));
    assert!(busy);

    invoker.release.notify_waiters();
    first.await.unwrap();
    assert_eq!(sink.last_ai_response().await.unwrap().0, "done waiting");
}

#[tokio::test]
async fn busy_queue_policy_serializes_turns() {
    let mut config = fast_config();
    config.busy_policy = BusyPolicy::Queue;
    let invoker = ScriptedInvoker::new(vec![
        Ok(claude_text("reply one")),
        Ok(claude_text("reply two")),
    ]);
    let orchestrator = Arc::new(build(config, invoker, RecordingTools::new()));
    let sink = Arc::new(RecordingSink::default());

    let a = {
        let (o, s) = (orchestrator.clone(), sink.clone());
        tokio::spawn(async move {
            o.handle_frame(r#"{"type":"chat","message":"one"}"#, s.as_ref()).await;
        })
    };
    let b = {
        let (o, s) = (orchestrator.clone(), sink.clone());
        tokio::spawn(async move {
            o.handle_frame(r#"{"type":"chat","message":"two"}"#, s.as_ref()).await;
        })
    };
    a.await.unwrap();
    b.await.unwrap();

    let responses: Vec<String> = sink
        .frames()
        .await
        .iter()
        .filter_map(|f| match f {
            ServerFrame::AiResponse { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(responses.len(), 2);

    // both user turns landed in history in arrival order, nothing interleaved
    let history = orchestrator.session().history().await;
    assert_eq!(history.len(), 4);
}

#[tokio::test]
async fn clear_frame_resets_history() {
    let invoker = ScriptedInvoker::new(vec![Ok(claude_text("hi there"))]);
    let orchestrator = build(fast_config(), invoker, RecordingTools::new());
    let sink = RecordingSink::default();

    orchestrator
        .handle_frame(r#"{"type":"chat","message":"hello"}"#, &sink)
        .await;
    assert_eq!(orchestrator.session().message_count().await, 2);

    orchestrator.handle_frame(r#"{"type":"clear"}"#, &sink).await;
    assert_eq!(orchestrator.session().message_count().await, 0);
    assert!(sink
        .frames()
        .await
        .iter()
        .any(|f| matches!(f, ServerFrame::HistoryCleared { .. })));
}

#[tokio::test]
async fn history_frame_returns_transcript() {
    let invoker = ScriptedInvoker::new(vec![Ok(claude_text("pong text"))]);
    let orchestrator = build(fast_config(), invoker, RecordingTools::new());
    let sink = RecordingSink::default();

    orchestrator
        .handle_frame(r#"{"type":"chat","message":"ping text"}"#, &sink)
        .await;
    orchestrator.handle_frame(r#"{"type":"history"}"#, &sink).await;

    let frames = sink.frames().await;
    let transcript = frames
        .iter()
        .find_map(|f| match f {
            ServerFrame::History { messages, .. } => Some(messages.clone()),
            _ => None,
        })
        .unwrap();
    let messages = transcript.as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "assistant");
}

#[tokio::test]
async fn closed_session_ignores_frames() {
    let orchestrator = build(
        fast_config(),
        ScriptedInvoker::new(vec![]),
        RecordingTools::new(),
    );
    let sink = RecordingSink::default();

    orchestrator.close().await;
    assert_eq!(orchestrator.phase().await, SessionPhase::Closed);

    orchestrator.handle_frame(r#"{"type":"ping"}"#, &sink).await;
    assert!(sink.frames().await.is_empty());
}
