//! Two-tier truncation of oversized tool results.
//!
//! | Tier | Applies to | Threshold | Target |
//! |------|-----------|-----------|--------|
//! | `NewResponse` | the trailing tool-result group of the current turn | `tool_result_new_response_threshold` | `tool_result_new_response_target` |
//! | `History` | tool results from earlier turns | `tool_result_history_threshold` | `tool_result_history_target` |
//!
//! Content that parses as JSON keeps a structured head — the first elements of
//! a root array or the first fields of a root object — followed by an explicit
//! `…truncated (M more items)` tail. Anything else keeps the first
//! target-size characters with an `…[truncated]` suffix.
//!
//! Targets are clamped below their thresholds, so truncated output is always
//! under the threshold and a second application is the identity.

use serde_json::Value;

use crate::chatbridge::config::BridgeConfig;
use crate::chatbridge::message::{ChatMessage, ContentBlock, MessageContent};

/// Which size budget applies to a given tool result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationTier {
    /// The most recent tool results of the current turn.
    NewResponse,
    /// Tool results that have aged into history.
    History,
}

/// Applies the two-tier truncation policy to conversation history.
#[derive(Debug, Clone)]
pub struct ToolResultTruncator {
    new_threshold: usize,
    new_target: usize,
    history_threshold: usize,
    history_target: usize,
}

impl ToolResultTruncator {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            config.tool_result_new_response_threshold,
            config.tool_result_new_response_target,
            config.tool_result_history_threshold,
            config.tool_result_history_target,
        )
    }

    /// Targets above their thresholds are clamped to 85% of the threshold.
    pub fn new(
        new_threshold: usize,
        new_target: usize,
        history_threshold: usize,
        history_target: usize,
    ) -> Self {
        let clamp = |threshold: usize, target: usize| {
            if target >= threshold {
                threshold * 85 / 100
            } else {
                target
            }
        };
        Self {
            new_threshold,
            new_target: clamp(new_threshold, new_target),
            history_threshold,
            history_target: clamp(history_threshold, history_target),
        }
    }

    /// Truncate oversized tool results across the whole history.
    ///
    /// The trailing run of consecutive tool-result messages is the current
    /// turn's response group and gets the generous `NewResponse` budget,
    /// shared proportionally when the group holds several results. Everything
    /// earlier is history and gets the aggressive `History` budget.
    pub fn apply(&self, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let trailing_start = trailing_tool_group_start(&messages);

        let trailing_total: usize = messages[trailing_start..]
            .iter()
            .map(|m| m.content_size())
            .sum();
        let trailing_count = messages.len() - trailing_start;

        // Per-message budget for the trailing group.
        let (group_threshold, group_target) =
            if trailing_count > 1 && trailing_total > self.new_threshold {
                (
                    self.new_threshold / trailing_count,
                    self.new_target / trailing_count,
                )
            } else {
                (self.new_threshold, self.new_target)
            };

        messages
            .into_iter()
            .enumerate()
            .map(|(i, msg)| {
                if !msg.is_tool_result() {
                    return msg;
                }
                if i >= trailing_start {
                    self.truncate_message(msg, group_threshold, group_target)
                } else {
                    self.truncate_message(msg, self.history_threshold, self.history_target)
                }
            })
            .collect()
    }

    /// Truncate one tool-result message against an explicit tier.
    pub fn truncate_with_tier(&self, msg: ChatMessage, tier: TruncationTier) -> ChatMessage {
        match tier {
            TruncationTier::NewResponse => {
                self.truncate_message(msg, self.new_threshold, self.new_target)
            }
            TruncationTier::History => {
                self.truncate_message(msg, self.history_threshold, self.history_target)
            }
        }
    }

    fn truncate_message(&self, mut msg: ChatMessage, threshold: usize, target: usize) -> ChatMessage {
        match &mut msg.content {
            MessageContent::Text(text) => {
                if text.chars().count() > threshold {
                    let truncated = truncate_content(text, target);
                    log::debug!(
                        "truncated tool result from {} to {} chars",
                        text.len(),
                        truncated.len()
                    );
                    *text = truncated;
                }
            }
            MessageContent::Blocks(blocks) => {
                // Several results in one message share the budget.
                let result_count = blocks
                    .iter()
                    .filter(|b| matches!(b, ContentBlock::ToolResult { .. }))
                    .count();
                let (per_threshold, per_target) = if result_count > 1 {
                    (threshold / result_count, target / result_count)
                } else {
                    (threshold, target)
                };
                for block in blocks {
                    if let ContentBlock::ToolResult { content, .. } = block {
                        if content.chars().count() > per_threshold {
                            *content = truncate_content(content, per_target);
                        }
                    }
                }
            }
        }
        msg
    }
}

/// Index where the trailing run of consecutive tool-result messages begins.
fn trailing_tool_group_start(messages: &[ChatMessage]) -> usize {
    let mut start = messages.len();
    for (i, msg) in messages.iter().enumerate().rev() {
        if msg.is_tool_result() {
            start = i;
        } else {
            break;
        }
    }
    start
}

/// Truncate `content` to roughly `target` characters.
///
/// JSON payloads keep a structured head with an explicit item-count tail;
/// plain text keeps its head with an `…[truncated]` suffix. Output never
/// exceeds `target`, which keeps the function idempotent for any
/// target < threshold.
pub fn truncate_content(content: &str, target: usize) -> String {
    if content.chars().count() <= target {
        return content.to_string();
    }

    if let Ok(value) = serde_json::from_str::<Value>(content) {
        if let Some(out) = truncate_json(&value, target) {
            return out;
        }
    }
    truncate_plain(content, target)
}

fn truncate_json(value: &Value, target: usize) -> Option<String> {
    match value {
        Value::Array(items) => {
            let mut kept: Vec<&Value> = Vec::new();
            let mut budget = target.saturating_sub(48); // room for brackets + tail
            for item in items {
                let len = item.to_string().chars().count() + 1;
                if len > budget {
                    break;
                }
                budget -= len;
                kept.push(item);
            }
            if kept.len() == items.len() {
                return Some(value.to_string());
            }
            let omitted = items.len() - kept.len();
            let head: Vec<String> = kept.iter().map(|v| v.to_string()).collect();
            Some(format!(
                "[{}]\n…truncated ({} more items)",
                head.join(","),
                omitted
            ))
        }
        Value::Object(map) => {
            let mut kept: Vec<String> = Vec::new();
            let mut kept_count = 0usize;
            let mut budget = target.saturating_sub(48);
            for (key, val) in map {
                let field = format!("{}:{}", Value::String(key.clone()), val);
                let len = field.chars().count() + 1;
                if len > budget {
                    break;
                }
                budget -= len;
                kept.push(field);
                kept_count += 1;
            }
            if kept_count == map.len() {
                return Some(value.to_string());
            }
            let omitted = map.len() - kept_count;
            Some(format!(
                "{{{}}}\n…truncated ({} more items)",
                kept.join(","),
                omitted
            ))
        }
        // Scalars fall through to plain-text truncation.
        _ => None,
    }
}

fn truncate_plain(content: &str, target: usize) -> String {
    const SUFFIX: &str = "…[truncated]";
    let keep = target.saturating_sub(SUFFIX.chars().count());
    let head: String = content.chars().take(keep).collect();
    format!("{}{}", head, SUFFIX)
}
