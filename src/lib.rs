//! # chatbridge
//!
//! chatbridge is a session-oriented bridge that lets a remote Large Language Model
//! transparently invoke a set of REST endpoints — described by an OpenAPI document —
//! on behalf of an interactive chat user connected over a persistent bidirectional
//! message channel.
//!
//! The crate provides carefully layered abstractions for:
//!
//! * **Sessions**: [`Session`] / [`SessionTable`] hold per-connection state — credentials,
//!   conversation history, rate gate — behind a single serializing gate
//! * **Tool Execution**: [`HttpToolExecutor`] turns a model's tool-use request into an
//!   authenticated HTTP call against the target API and folds the response back into
//!   a tool result the model can read
//! * **Conversation Management**: [`ConversationManager`] enforces context budgets with
//!   pair-preserving eviction — a `tool_use` block and its `tool_result` are never
//!   separated — plus two-tier truncation of oversized tool results
//! * **Model Families**: [`ModelFamily`] adapters shape the same internal history into
//!   the Claude, GPT-style, or Llama wire formats and parse each family's replies
//! * **Request Pipeline**: [`LlmPipeline`] layers retry with jittered backoff, rate
//!   limiting, and context-shrink recovery over a pluggable [`ModelInvoker`]
//! * **Orchestration**: [`SessionOrchestrator`] runs the per-connection state machine
//!   and the bounded multi-turn tool loop
//!
//! ## Core Concepts
//!
//! ### The turn loop
//!
//! A `chat` frame starts a turn: the user message is appended to history, a snapshot
//! satisfying the pair-integrity and budget invariants is formatted for the session's
//! model family and sent to the model. If the reply contains tool-use requests they
//! are fanned out (bounded, order-preserving), the results are appended, and the model
//! is called again — until it produces a terminal text reply or the per-turn budgets
//! (`max_tool_calls`, wall clock) run out.
//!
//! ### Wiring a bridge
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chatbridge::{BridgeConfig, LlmPipeline, SessionTable, ToolCatalog};
//! use chatbridge::invoker::{InvokeError, ModelInvoker};
//! use async_trait::async_trait;
//!
//! struct MyInvoker;
//!
//! #[async_trait]
//! impl ModelInvoker for MyInvoker {
//!     async fn invoke(
//!         &self,
//!         model_id: &str,
//!         request_body: serde_json::Value,
//!     ) -> Result<serde_json::Value, InvokeError> {
//!         // call your model-invocation service here
//!         Err(InvokeError::Fatal("not wired".into()))
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! chatbridge::init_logger();
//!
//! let config = Arc::new(BridgeConfig::from_env());
//! let spec: serde_json::Value = serde_json::from_str(r#"{"openapi":"3.1.0","paths":{}}"#)?;
//! let catalog = Arc::new(ToolCatalog::from_openapi(&spec, &config)?);
//! let pipeline = Arc::new(LlmPipeline::new(Arc::new(MyInvoker), config.clone()));
//! let sessions = Arc::new(SessionTable::new(config));
//! # Ok(())
//! # }
//! ```
//!
//! With the `ws-server` feature enabled, [`server::serve`] exposes the bridge as an
//! axum WebSocket endpoint speaking the JSON frame protocol
//! (`auth` / `logout` / `chat` / `ping` in, `ai_response` / `typing` / … out).

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// The helper is intentionally lightweight so that applications embedding chatbridge
/// can opt-in to simple `RUST_LOG` driven diagnostics without having to choose a
/// specific logging backend upfront.
///
/// ```rust
/// chatbridge::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

// Import the top-level `chatbridge` module.
pub mod chatbridge;

// Re-exporting key items for easier external access.
pub use chatbridge::adapters;
pub use chatbridge::adapters::{ModelFamily, SamplingParams};
pub use chatbridge::catalog;
pub use chatbridge::chunker;
pub use chatbridge::config;
pub use chatbridge::conversation;
pub use chatbridge::executor;
pub use chatbridge::frames;
pub use chatbridge::http_pool;
pub use chatbridge::orchestrator;
pub use chatbridge::pipeline;
pub use chatbridge::rate;
pub use chatbridge::retry;
pub use chatbridge::session;
pub use chatbridge::truncation;
pub use chatbridge::catalog::{ParamLocation, ToolCatalog, ToolDescriptor, ToolParameter};
pub use chatbridge::chunker::MessageChunker;
pub use chatbridge::config::{BridgeConfig, BusyPolicy, ConversationStrategy};
pub use chatbridge::conversation::ConversationManager;
pub use chatbridge::credentials;
pub use chatbridge::credentials::{AuthHint, CredentialError, CredentialStore, Credentials};
pub use chatbridge::executor::{HttpToolExecutor, ToolInvoker, ToolOutcome};
pub use chatbridge::frames::{ClientFrame, ServerFrame};
pub use chatbridge::invoker;
pub use chatbridge::invoker::{InvokeError, ModelInvoker, ModelReply, ToolCallRequest};
pub use chatbridge::message;
pub use chatbridge::message::{ChatMessage, ContentBlock, MessageContent, Role};
pub use chatbridge::orchestrator::{ChannelSink, SessionOrchestrator, SessionPhase};
pub use chatbridge::pipeline::{AssistantReply, LlmPipeline};
pub use chatbridge::rate::TokenBucket;
pub use chatbridge::retry::RetryPolicy;
pub use chatbridge::session::{Session, SessionTable};
pub use chatbridge::truncation::{ToolResultTruncator, TruncationTier};

#[cfg(feature = "ws-server")]
pub use chatbridge::server;
