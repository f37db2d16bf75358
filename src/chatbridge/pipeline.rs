//! LLM request pipeline: formatting, invocation, retry, and graceful
//! degradation.
//!
//! One [`LlmPipeline`] is shared by every session. Each `generate` call:
//!
//! 1. takes the session's budget-compliant history snapshot,
//! 2. waits on the session's rate gate,
//! 3. formats the snapshot for the session's model family and invokes the
//!    [`ModelInvoker`],
//! 4. classifies failures — transient errors retry with jittered backoff,
//!    rate limits honor any `Retry-After` hint, context-length errors shrink
//!    the snapshot through the conversation manager and retry once more,
//!    everything else surfaces as a fatal assistant reply the orchestrator can
//!    forward without crashing the session.

use std::sync::Arc;
use std::sync::RwLock;

use crate::chatbridge::adapters::{strip_reasoning_tags, ModelFamily, SamplingParams};
use crate::chatbridge::config::BridgeConfig;
use crate::chatbridge::conversation::ConversationManager;
use crate::chatbridge::invoker::{InvokeError, ModelInvoker, ToolCallRequest};
use crate::chatbridge::message::ChatMessage;
use crate::chatbridge::rate::TokenBucket;
use crate::chatbridge::retry::RetryPolicy;

/// Outcome of one pipeline round, as seen by the orchestrator.
#[derive(Debug, Clone)]
pub enum AssistantReply {
    /// Terminal natural-language reply.
    Final {
        /// Text retained in history (reasoning tags included).
        text: String,
        /// Text surfaced to the client (reasoning tags stripped).
        display_text: String,
    },
    /// The model requested tool invocations.
    ToolUse {
        text: String,
        calls: Vec<ToolCallRequest>,
    },
    /// Unrecoverable failure rendered as a user-facing message.
    Fatal { message: String },
}

/// Shared model-request pipeline.
pub struct LlmPipeline {
    invoker: Arc<dyn ModelInvoker>,
    config: Arc<BridgeConfig>,
    retry: RetryPolicy,
    sampling: SamplingParams,
    /// Pre-invocation system-prompt override (the knowledge-base hook point).
    system_prompt_override: RwLock<Option<String>>,
}

impl LlmPipeline {
    pub fn new(invoker: Arc<dyn ModelInvoker>, config: Arc<BridgeConfig>) -> Self {
        Self {
            invoker,
            retry: RetryPolicy::from_config(&config),
            sampling: SamplingParams::from_config(&config),
            config,
            system_prompt_override: RwLock::new(None),
        }
    }

    /// Replace the system prompt for subsequent invocations.
    ///
    /// Hook point for retrieval-augmented prompt builders; `None` restores the
    /// configured prompt.
    pub fn set_system_prompt_override(&self, prompt: Option<String>) {
        if let Ok(mut slot) = self.system_prompt_override.write() {
            *slot = prompt;
        }
    }

    fn system_prompt(&self) -> String {
        self.system_prompt_override
            .read()
            .ok()
            .and_then(|slot| slot.clone())
            .unwrap_or_else(|| self.config.system_prompt.clone())
    }

    /// Run one model round over `snapshot`.
    ///
    /// `conversation` is consulted only for context-length recovery; `rate` is
    /// the calling session's gate.
    pub async fn generate(
        &self,
        family: ModelFamily,
        snapshot: Vec<ChatMessage>,
        tools: &[serde_json::Value],
        conversation: &ConversationManager,
        rate: &TokenBucket,
    ) -> AssistantReply {
        let mut snapshot = snapshot;
        let mut attempts = 0u32;
        let mut shrink_attempted = false;
        let system_prompt = self.system_prompt();

        loop {
            rate.acquire().await;

            let body = family.format_request(&snapshot, tools, &system_prompt, &self.sampling);
            match self.invoker.invoke(&self.config.model_id, body).await {
                Ok(raw) => {
                    let reply = family.parse_reply(&raw);
                    if reply.wants_tools() {
                        return AssistantReply::ToolUse {
                            text: reply.text,
                            calls: reply.tool_calls,
                        };
                    }
                    let display_text = strip_reasoning_tags(&reply.text);
                    return AssistantReply::Final {
                        text: reply.text,
                        display_text,
                    };
                }

                Err(InvokeError::Transient(msg)) => {
                    if attempts as usize >= self.retry.max_retries {
                        log::error!("model invocation failed after {} attempts: {}", attempts + 1, msg);
                        return AssistantReply::Fatal {
                            message: "I'm having trouble reaching the AI model. Please try again in a moment."
                                .to_string(),
                        };
                    }
                    let delay = self.retry.delay_for(attempts);
                    log::warn!(
                        "transient model error (attempt {}), retrying in {:?}: {}",
                        attempts + 1,
                        delay,
                        msg
                    );
                    tokio::time::sleep(delay).await;
                    attempts += 1;
                }

                Err(InvokeError::RateLimited { retry_after, message }) => {
                    if attempts as usize >= self.retry.max_retries {
                        log::error!("still rate limited after {} attempts: {}", attempts + 1, message);
                        return AssistantReply::Fatal {
                            message: "I'm receiving too many requests. Please wait a moment and try again."
                                .to_string(),
                        };
                    }
                    let delay = retry_after.unwrap_or_else(|| self.retry.delay_for(attempts));
                    log::warn!("rate limited, waiting {:?}: {}", delay, message);
                    tokio::time::sleep(delay).await;
                    attempts += 1;
                }

                Err(InvokeError::ContextTooLong(msg)) => {
                    if shrink_attempted {
                        log::error!("context still too long after shrink: {}", msg);
                        return AssistantReply::Fatal {
                            message: "The conversation has grown too large for the model even after \
                                      trimming. Please start a new conversation."
                                .to_string(),
                        };
                    }
                    log::warn!("context too long, shrinking history and retrying: {}", msg);
                    snapshot = conversation.shrink_for_retry(snapshot);
                    shrink_attempted = true;
                }

                Err(InvokeError::AuthFailed(msg)) => {
                    log::error!("model service auth failure: {}", msg);
                    return AssistantReply::Fatal {
                        message: "I don't have access to the AI model right now. Please contact support."
                            .to_string(),
                    };
                }

                Err(InvokeError::Fatal(msg)) => {
                    log::error!("fatal model invocation error: {}", msg);
                    return AssistantReply::Fatal {
                        message: format!("I encountered an error: {}. Please try again.", msg),
                    };
                }
            }
        }
    }
}
