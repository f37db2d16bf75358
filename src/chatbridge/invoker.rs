//! Model-invocation collaborator contract.
//!
//! A [`ModelInvoker`] is a capability supplied by the embedding application:
//! it submits a family-formatted request body to the model-invocation service
//! and returns the raw reply document. The bridge never speaks to a provider
//! SDK directly — the pipeline formats, the invoker transports, the adapters
//! parse.
//!
//! Error kinds are distinguishable so the pipeline can pick the right
//! recovery: retry with backoff, honor a rate-limit hint, shrink the
//! conversation, or surface a fatal reply.

use std::error::Error;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

/// Errors surfaced by a [`ModelInvoker`].
#[derive(Debug, Clone)]
pub enum InvokeError {
    /// Transient transport failure; retried with backoff.
    Transient(String),
    /// Throttled by the service; `retry_after` carries any server hint.
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    /// The formatted request exceeds the model's context window.
    ContextTooLong(String),
    /// Authentication/authorization failure against the model service.
    AuthFailed(String),
    /// Malformed request or any other non-retryable failure.
    Fatal(String),
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvokeError::Transient(msg) => write!(f, "transient invocation error: {}", msg),
            InvokeError::RateLimited { message, .. } => write!(f, "rate limited: {}", message),
            InvokeError::ContextTooLong(msg) => write!(f, "context too long: {}", msg),
            InvokeError::AuthFailed(msg) => write!(f, "model auth failed: {}", msg),
            InvokeError::Fatal(msg) => write!(f, "fatal invocation error: {}", msg),
        }
    }
}

impl Error for InvokeError {}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    /// Pairing id; echoed back as the tool_result reference.
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A parsed model reply: possibly-empty text plus zero or more tool requests.
#[derive(Debug, Clone, Default)]
pub struct ModelReply {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub stop_reason: Option<String>,
}

impl ModelReply {
    /// True when the reply requests at least one tool invocation.
    pub fn wants_tools(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Capability to invoke the remote model service.
///
/// Implementations transport `request_body` (already shaped for the model
/// family by the adapters) and return the provider's raw reply document.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(&self, model_id: &str, request_body: Value) -> Result<Value, InvokeError>;
}
