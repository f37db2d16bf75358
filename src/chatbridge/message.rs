//! Internal message model shared by every component.
//!
//! A [`ChatMessage`] is family-neutral: the same typed representation backs
//! Claude-style block content, GPT-style tool-role messages, and Llama-style
//! flagged text. The conversation manager only ever sees this abstract shape;
//! family-specific serialization lives in the [`adapters`](crate::adapters).
//!
//! Three representations of a tool result coexist and are recognised by the
//! same predicates:
//!
//! - Claude-style: `role = user`, content blocks containing
//!   [`ContentBlock::ToolResult`]
//! - GPT-style: `role = tool` with a `tool_call_id` and plain text content
//! - Llama-style: `role = user` with the `is_tool_result` marker and plain text

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Steers the model; at most one, at the front of history.
    System,
    /// A human turn, or a Claude/Llama-shaped tool result.
    User,
    /// Model output, possibly carrying tool-use blocks.
    Assistant,
    /// GPT-style tool result carrier.
    Tool,
}

/// One block of structured message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text { text: String },
    /// A model request to invoke a named tool.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// The outcome of a tool invocation, paired to its `ToolUse` by id.
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

/// Message content: a plain string or a sequence of typed blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Concatenated text of all textual parts (tool results included).
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => {
                let mut out = String::new();
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => out.push_str(text),
                        ContentBlock::ToolResult { content, .. } => out.push_str(content),
                        ContentBlock::ToolUse { .. } => {}
                    }
                }
                out
            }
        }
    }

    /// Size in characters, used for all char-denominated budgets.
    pub fn size(&self) -> usize {
        match self {
            MessageContent::Text(t) => t.chars().count(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.chars().count(),
                    ContentBlock::ToolResult { content, .. } => content.chars().count(),
                    ContentBlock::ToolUse { input, .. } => input.to_string().chars().count(),
                })
                .sum(),
        }
    }
}

/// A single message in conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
    /// GPT-style pairing reference carried on `role = tool` messages, and kept
    /// on Llama-style results so pairing survives format conversion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Llama-style tool-result marker on plain-text user messages.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_tool_result: bool,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    fn new(role: Role, content: MessageContent) -> Self {
        Self {
            role,
            content,
            tool_call_id: None,
            is_tool_result: false,
            timestamp: Utc::now(),
        }
    }

    /// A system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, MessageContent::Text(text.into()))
    }

    /// A plain user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, MessageContent::Text(text.into()))
    }

    /// A plain assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, MessageContent::Text(text.into()))
    }

    /// An assistant message carrying structured blocks (text and/or tool_use).
    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self::new(Role::Assistant, MessageContent::Blocks(blocks))
    }

    /// A Claude-style tool-result message: `role = user` with result blocks.
    pub fn tool_result_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self::new(Role::User, MessageContent::Blocks(blocks))
    }

    /// A GPT-style tool-result message: `role = tool` + `tool_call_id`.
    pub fn gpt_tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Tool, MessageContent::Text(content.into()));
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// A Llama-style tool-result message: `role = user` + marker.
    pub fn llama_tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::User, MessageContent::Text(content.into()));
        msg.tool_call_id = Some(tool_call_id.into());
        msg.is_tool_result = true;
        msg
    }

    /// Polymorphic tool-result predicate covering all three family shapes.
    pub fn is_tool_result(&self) -> bool {
        if self.role == Role::Tool && self.tool_call_id.is_some() {
            return true;
        }
        if self.is_tool_result {
            return true;
        }
        if let MessageContent::Blocks(blocks) = &self.content {
            return blocks
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolResult { .. }));
        }
        false
    }

    /// True for assistant messages carrying at least one tool_use block.
    pub fn has_tool_use(&self) -> bool {
        if self.role != Role::Assistant {
            return false;
        }
        if let MessageContent::Blocks(blocks) = &self.content {
            return blocks
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolUse { .. }));
        }
        false
    }

    /// Ids of all tool_use blocks on this message.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        if let MessageContent::Blocks(blocks) = &self.content {
            for block in blocks {
                if let ContentBlock::ToolUse { id, .. } = block {
                    ids.push(id.as_str());
                }
            }
        }
        ids
    }

    /// Pairing references of all tool results on this message, across shapes.
    pub fn tool_result_refs(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        if let MessageContent::Blocks(blocks) = &self.content {
            for block in blocks {
                if let ContentBlock::ToolResult { tool_use_id, .. } = block {
                    refs.push(tool_use_id.as_str());
                }
            }
        }
        if refs.is_empty() && (self.role == Role::Tool || self.is_tool_result) {
            if let Some(id) = &self.tool_call_id {
                refs.push(id.as_str());
            }
        }
        refs
    }

    /// Character size of the content, for budget decisions.
    pub fn content_size(&self) -> usize {
        self.content.size()
    }

    /// Concatenated text content.
    pub fn text(&self) -> String {
        self.content.as_text()
    }
}
