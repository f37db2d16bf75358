//! Per-connection state machine and the bounded multi-turn tool loop.
//!
//! One [`SessionOrchestrator`] serves one channel. Inbound frames are
//! dispatched against the session phase:
//!
//! | phase        | accepts                                   |
//! |--------------|-------------------------------------------|
//! | `OpenUnauth` | `auth`, `chat` (if auth optional), `logout`, `ping` |
//! | `OpenAuth`   | `chat`, `auth` (re-auth), `logout`, `ping` |
//! | `Processing` | `chat` rejected or queued per `busy_policy` |
//! | `Closed`     | terminal                                   |
//!
//! The turn loop is iterative with explicit counters: at most
//! `max_tool_calls` tool invocations across all nested rounds and a
//! wall-clock deadline per turn; exceeding either yields a terminal assistant
//! reply instead of an error. History mutations are committed only at step
//! boundaries — a channel close drops the in-flight future between commits,
//! which both cancels outstanding I/O and leaves history consistent.

use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::chatbridge::config::{BridgeConfig, BusyPolicy};
use crate::chatbridge::conversation::ConversationManager;
use crate::chatbridge::executor::{ToolInvoker, ToolOutcome};
use crate::chatbridge::frames::{now_ts, ClientFrame, FrameError, ServerFrame};
use crate::chatbridge::invoker::ToolCallRequest;
use crate::chatbridge::message::{ChatMessage, ContentBlock};
use crate::chatbridge::pipeline::{AssistantReply, LlmPipeline};
use crate::chatbridge::session::Session;
use crate::chatbridge::adapters::ModelFamily;
use crate::chatbridge::catalog::ToolCatalog;

/// Connection-scoped session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    OpenUnauth,
    OpenAuth,
    Processing,
    Closed,
}

/// Capability to push frames back to the client.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn send(&self, frame: ServerFrame) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Drives one session over one channel.
pub struct SessionOrchestrator {
    session: Arc<Session>,
    pipeline: Arc<LlmPipeline>,
    tools: Arc<dyn ToolInvoker>,
    catalog: Arc<ToolCatalog>,
    conversation: ConversationManager,
    config: Arc<BridgeConfig>,
    phase: Mutex<SessionPhase>,
    /// Turn gate: exactly one chat turn in flight per session.
    turn_gate: Arc<Mutex<()>>,
}

impl SessionOrchestrator {
    pub fn new(
        session: Arc<Session>,
        pipeline: Arc<LlmPipeline>,
        tools: Arc<dyn ToolInvoker>,
        catalog: Arc<ToolCatalog>,
        config: Arc<BridgeConfig>,
    ) -> Self {
        Self {
            session,
            pipeline,
            tools,
            catalog,
            conversation: ConversationManager::from_config(&config),
            config,
            phase: Mutex::new(SessionPhase::OpenUnauth),
            turn_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Current phase (mainly for tests and diagnostics).
    pub async fn phase(&self) -> SessionPhase {
        *self.phase.lock().await
    }

    /// The session this orchestrator drives.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Mark the channel closed. In-flight work is cancelled by dropping the
    /// connection's dispatch future; this records the terminal phase.
    pub async fn close(&self) {
        *self.phase.lock().await = SessionPhase::Closed;
    }

    /// Dispatch one raw inbound frame.
    pub async fn handle_frame(&self, raw: &str, sink: &dyn ChannelSink) {
        if *self.phase.lock().await == SessionPhase::Closed {
            return;
        }
        self.session.touch().await;

        let frame = match ClientFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e @ FrameError::Malformed(_)) | Err(e @ FrameError::UnknownType(_)) => {
                self.send(sink, ServerFrame::error(e.to_string())).await;
                return;
            }
        };

        match frame {
            ClientFrame::Ping => {
                self.send(sink, ServerFrame::pong()).await;
            }
            ClientFrame::Auth(request) => self.handle_auth(request, sink).await,
            ClientFrame::Logout => self.handle_logout(sink).await,
            ClientFrame::Chat { message } => self.handle_chat(message, sink).await,
            ClientFrame::History => self.handle_history(sink).await,
            ClientFrame::Clear => {
                self.session.clear_history().await;
                self.send(
                    sink,
                    ServerFrame::HistoryCleared {
                        message: "Conversation history cleared".to_string(),
                        timestamp: now_ts(),
                    },
                )
                .await;
            }
        }
    }

    async fn handle_auth(&self, request: crate::chatbridge::frames::AuthRequest, sink: &dyn ChannelSink) {
        let credentials = match request.into_credentials() {
            Ok(credentials) => credentials,
            Err(message) => {
                self.send(sink, ServerFrame::auth_failed(message)).await;
                return;
            }
        };

        let auth_type = credentials.auth_type();
        if !self.config.auth_type_supported(auth_type) {
            self.send(
                sink,
                ServerFrame::auth_failed(format!("auth type {} is not enabled", auth_type)),
            )
            .await;
            return;
        }

        match self.session.credentials.set(credentials).await {
            Ok(()) => {
                log::info!(
                    "authentication configured for session {}: {}",
                    self.session.id,
                    auth_type
                );
                let mut phase = self.phase.lock().await;
                if *phase == SessionPhase::OpenUnauth {
                    *phase = SessionPhase::OpenAuth;
                }
                drop(phase);
                self.send(sink, ServerFrame::auth_configured(auth_type)).await;
            }
            Err(e) => {
                self.send(sink, ServerFrame::auth_failed(e.to_string())).await;
            }
        }
    }

    async fn handle_logout(&self, sink: &dyn ChannelSink) {
        self.session.credentials.clear().await;
        let mut phase = self.phase.lock().await;
        if *phase == SessionPhase::OpenAuth {
            *phase = SessionPhase::OpenUnauth;
        }
        drop(phase);
        log::info!("session {} logged out", self.session.id);
        self.send(sink, ServerFrame::logout_success()).await;
    }

    async fn handle_history(&self, sink: &dyn ChannelSink) {
        let history = self.session.history().await;
        let messages = serde_json::to_value(&history).unwrap_or(Value::Array(vec![]));
        self.send(
            sink,
            ServerFrame::History {
                messages,
                timestamp: now_ts(),
            },
        )
        .await;
    }

    async fn handle_chat(&self, message: String, sink: &dyn ChannelSink) {
        if message.trim().is_empty() {
            self.send(sink, ServerFrame::error("Empty message")).await;
            return;
        }

        if self.config.require_tool_auth && !self.session.credentials.is_configured().await {
            self.send(
                sink,
                ServerFrame::auth_failed(
                    "Authentication is required before sending messages. Please authenticate first.",
                ),
            )
            .await;
            return;
        }

        // Exactly one turn in flight per session.
        let _turn = match self.config.busy_policy {
            BusyPolicy::Reject => match self.turn_gate.clone().try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => {
                    self.send(
                        sink,
                        ServerFrame::error("busy: a turn is already in progress"),
                    )
                    .await;
                    return;
                }
            },
            BusyPolicy::Queue => self.turn_gate.clone().lock_owned().await,
        };

        {
            let mut phase = self.phase.lock().await;
            *phase = SessionPhase::Processing;
        }

        self.run_turn(message, sink).await;

        let mut phase = self.phase.lock().await;
        if *phase == SessionPhase::Processing {
            *phase = if self.session.credentials.is_configured().await {
                SessionPhase::OpenAuth
            } else {
                SessionPhase::OpenUnauth
            };
        }
    }

    /// One complete user turn: model rounds interleaved with tool fan-outs
    /// until a terminal reply, a budget stop, or the wall-clock deadline.
    async fn run_turn(&self, message: String, sink: &dyn ChannelSink) {
        self.session.append(ChatMessage::user(message)).await;

        let deadline = Instant::now() + self.config.turn_deadline;
        let tools_schema = self.catalog.schema_functions();
        let mut total_tool_calls = 0usize;
        let mut all_calls: Vec<Value> = Vec::new();
        let mut all_results: Vec<Value> = Vec::new();
        let mut round = 0usize;

        self.send(sink, ServerFrame::typing(true, "AI is thinking...")).await;

        loop {
            round += 1;

            let snapshot = {
                let history = self.session.history().await;
                self.conversation.snapshot_for_llm(&history)
            };

            let reply = self
                .pipeline
                .generate(
                    self.session.family,
                    snapshot,
                    &tools_schema,
                    &self.conversation,
                    &self.session.rate,
                )
                .await;

            match reply {
                AssistantReply::Final { text, display_text } => {
                    self.session.append(ChatMessage::assistant(text)).await;
                    self.session.trim_to_budget(&self.conversation).await;
                    self.finish_turn(sink, display_text, &all_calls, &all_results)
                        .await;
                    return;
                }

                AssistantReply::Fatal { message } => {
                    self.session.append(ChatMessage::assistant(message.clone())).await;
                    self.finish_turn(sink, message, &all_calls, &all_results).await;
                    return;
                }

                AssistantReply::ToolUse { text, calls } => {
                    if total_tool_calls + calls.len() > self.config.max_tool_calls {
                        log::warn!(
                            "session {} exceeded max_tool_calls ({})",
                            self.session.id,
                            self.config.max_tool_calls
                        );
                        let notice = budget_notice(&text, "tool-call budget exhausted");
                        self.session.append(ChatMessage::assistant(notice.clone())).await;
                        self.finish_turn(sink, notice, &all_calls, &all_results).await;
                        return;
                    }
                    if Instant::now() >= deadline {
                        log::warn!("session {} exceeded turn deadline", self.session.id);
                        let notice = budget_notice(&text, "turn time budget exhausted");
                        self.session.append(ChatMessage::assistant(notice.clone())).await;
                        self.finish_turn(sink, notice, &all_calls, &all_results).await;
                        return;
                    }

                    let batch: Vec<ToolCallRequest> = calls
                        .into_iter()
                        .take(self.config.max_tool_calls_per_turn)
                        .collect();
                    total_tool_calls += batch.len();

                    self.send(
                        sink,
                        ServerFrame::typing(
                            true,
                            format!(
                                "Calling {} tool{}... (round {})",
                                batch.len(),
                                if batch.len() == 1 { "" } else { "s" },
                                round
                            ),
                        ),
                    )
                    .await;

                    // Commit the assistant's request before executing it.
                    self.session
                        .append(assistant_with_tool_use(&text, &batch))
                        .await;

                    let outcomes = self
                        .tools
                        .execute_many(&batch, self.config.max_tool_calls_per_turn)
                        .await;

                    for call in &batch {
                        all_calls.push(serde_json::json!({
                            "id": call.id,
                            "name": call.name,
                            "arguments": call.arguments,
                        }));
                    }
                    for outcome in &outcomes {
                        all_results.push(serde_json::json!({
                            "tool_call_id": outcome.tool_use_id,
                            "name": outcome.name,
                            "result": outcome.content,
                            "is_error": outcome.is_error,
                        }));
                    }

                    self.session
                        .append_all(tool_result_messages(self.session.family, &outcomes))
                        .await;
                    self.session.trim_to_budget(&self.conversation).await;
                }
            }
        }
    }

    async fn finish_turn(
        &self,
        sink: &dyn ChannelSink,
        message: String,
        calls: &[Value],
        results: &[Value],
    ) {
        self.send(sink, ServerFrame::typing(false, "")).await;
        self.send(
            sink,
            ServerFrame::AiResponse {
                message,
                tool_calls: (!calls.is_empty()).then(|| Value::Array(calls.to_vec())),
                tool_results: (!results.is_empty()).then(|| Value::Array(results.to_vec())),
                timestamp: now_ts(),
            },
        )
        .await;
    }

    async fn send(&self, sink: &dyn ChannelSink, frame: ServerFrame) {
        if let Err(e) = sink.send(frame).await {
            log::error!("failed to send frame on session {}: {}", self.session.id, e);
        }
    }
}

/// The assistant message carrying this round's tool_use blocks.
fn assistant_with_tool_use(text: &str, calls: &[ToolCallRequest]) -> ChatMessage {
    let mut blocks = Vec::with_capacity(calls.len() + 1);
    if !text.trim().is_empty() {
        blocks.push(ContentBlock::Text {
            text: text.to_string(),
        });
    }
    for call in calls {
        blocks.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.arguments.clone(),
        });
    }
    ChatMessage::assistant_blocks(blocks)
}

/// Shape tool outcomes into history messages for the session's model family.
///
/// Claude: one user message holding all result blocks. GPT: one tool-role
/// message per outcome. Llama: one flagged user message per outcome. Order
/// follows the outcome slice, which the executor guarantees is request order.
fn tool_result_messages(family: ModelFamily, outcomes: &[ToolOutcome]) -> Vec<ChatMessage> {
    match family {
        ModelFamily::Claude => {
            let blocks: Vec<ContentBlock> = outcomes
                .iter()
                .map(|o| ContentBlock::ToolResult {
                    tool_use_id: o.tool_use_id.clone(),
                    content: o.content.clone(),
                    is_error: o.is_error,
                })
                .collect();
            vec![ChatMessage::tool_result_blocks(blocks)]
        }
        ModelFamily::Gpt => outcomes
            .iter()
            .map(|o| ChatMessage::gpt_tool_result(&o.tool_use_id, &o.content))
            .collect(),
        ModelFamily::Llama => outcomes
            .iter()
            .map(|o| {
                ChatMessage::llama_tool_result(
                    &o.tool_use_id,
                    format!("[Tool Result for {}({})]\n{}", o.name, o.tool_use_id, o.content),
                )
            })
            .collect(),
    }
}

fn budget_notice(text: &str, reason: &str) -> String {
    if text.trim().is_empty() {
        reason.to_string()
    } else {
        format!("{}\n\n[{}]", text, reason)
    }
}
