//! Model-family wire-format adapters.
//!
//! Each family maps the internal message sequence to its own request shape and
//! parses its own reply document back into a family-neutral [`ModelReply`]:
//!
//! - [`claude`] — block-structured messages with nested `tool_use` /
//!   `tool_result`, system text out-of-band
//! - [`gpt`] — flat message list, `tool_calls` on assistant messages,
//!   `tool_call_id` on tool-role messages
//! - [`llama`] — a single special-token prompt string with `<tool_call>`
//!   markers for tool requests
//!
//! Everything upstream of this module (conversation manager, orchestrator)
//! works on the abstract [`ChatMessage`](crate::message::ChatMessage) only.

pub mod claude;
pub mod gpt;
pub mod llama;

use serde_json::Value;

use crate::chatbridge::config::BridgeConfig;
use crate::chatbridge::invoker::ModelReply;
use crate::chatbridge::message::ChatMessage;

/// Sampling parameters forwarded with every invocation.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub stop_sequences: Vec<String>,
}

impl SamplingParams {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            top_p: 0.9,
            stop_sequences: config.stop_sequences.clone(),
        }
    }
}

/// Supported model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Claude,
    Gpt,
    Llama,
}

impl ModelFamily {
    /// Infer the family from a model identifier.
    ///
    /// ```rust
    /// use chatbridge::ModelFamily;
    ///
    /// assert_eq!(ModelFamily::from_model_id("anthropic.claude-3-5-sonnet-20241022-v2:0"),
    ///            ModelFamily::Claude);
    /// assert_eq!(ModelFamily::from_model_id("meta.llama3-70b-instruct-v1:0"),
    ///            ModelFamily::Llama);
    /// assert_eq!(ModelFamily::from_model_id("openai.gpt-oss-120b-1:0"), ModelFamily::Gpt);
    /// ```
    pub fn from_model_id(model_id: &str) -> Self {
        let id = model_id.to_lowercase();
        if id.contains("claude") {
            ModelFamily::Claude
        } else if id.contains("llama") {
            ModelFamily::Llama
        } else {
            ModelFamily::Gpt
        }
    }

    /// Build the request body for this family.
    ///
    /// `tools` are JSON-schema function descriptions from
    /// [`ToolCatalog::schema_functions`](crate::ToolCatalog::schema_functions);
    /// `system_prompt` is injected when history carries no system message.
    pub fn format_request(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
        system_prompt: &str,
        sampling: &SamplingParams,
    ) -> Value {
        match self {
            ModelFamily::Claude => claude::format_request(messages, tools, system_prompt, sampling),
            ModelFamily::Gpt => gpt::format_request(messages, tools, system_prompt, sampling),
            ModelFamily::Llama => llama::format_request(messages, tools, system_prompt, sampling),
        }
    }

    /// Parse the raw reply document for this family.
    pub fn parse_reply(&self, raw: &Value) -> ModelReply {
        match self {
            ModelFamily::Claude => claude::parse_reply(raw),
            ModelFamily::Gpt => gpt::parse_reply(raw),
            ModelFamily::Llama => llama::parse_reply(raw),
        }
    }
}

/// Strip family-specific reasoning tags from text surfaced to the client.
///
/// `<reasoning>…</reasoning>` spans are removed for display; the full text is
/// retained in history so models that expect their own reasoning still see it.
pub fn strip_reasoning_tags(text: &str) -> String {
    const OPEN: &str = "<reasoning>";
    const CLOSE: &str = "</reasoning>";

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        match rest.find(OPEN) {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                out.push_str(&rest[..start]);
                match rest[start..].find(CLOSE) {
                    Some(end_rel) => {
                        rest = &rest[start + end_rel + CLOSE.len()..];
                    }
                    None => break, // unterminated tag: drop the tail
                }
            }
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_inference() {
        assert_eq!(
            ModelFamily::from_model_id("us.anthropic.claude-3-haiku"),
            ModelFamily::Claude
        );
        assert_eq!(ModelFamily::from_model_id("meta.llama3-8b"), ModelFamily::Llama);
        assert_eq!(ModelFamily::from_model_id("mistral.mixtral"), ModelFamily::Gpt);
    }

    #[test]
    fn reasoning_tags_removed_for_display() {
        let text = "<reasoning>thinking hard</reasoning>The answer is 4.";
        assert_eq!(strip_reasoning_tags(text), "The answer is 4.");

        let multi = "a<reasoning>x</reasoning>b<reasoning>y</reasoning>c";
        assert_eq!(strip_reasoning_tags(multi), "abc");

        let unterminated = "visible<reasoning>never closed";
        assert_eq!(strip_reasoning_tags(unterminated), "visible");

        assert_eq!(strip_reasoning_tags("plain"), "plain");
    }
}
