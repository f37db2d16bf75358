//! Pre-eviction splitting of oversized plain messages.
//!
//! When a single message exceeds the per-message byte budget it is split into a
//! sequence of continuation messages, breaking at the first boundary kind that
//! succeeds under the budget: paragraph, line, sentence, word, then raw
//! characters. Tool-use/tool-result messages are never chunked — a tool result
//! is an atomic unit the truncator handles instead.

use crate::chatbridge::config::BridgeConfig;
use crate::chatbridge::message::{ChatMessage, MessageContent};

/// Splits oversized plain messages into ordered continuation chunks.
#[derive(Debug, Clone)]
pub struct MessageChunker {
    enabled: bool,
    max_message_size: usize,
    chunk_size: usize,
}

impl MessageChunker {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            enabled: config.enable_message_chunking,
            max_message_size: config.max_message_size,
            chunk_size: config.chunk_size,
        }
    }

    pub fn new(enabled: bool, max_message_size: usize, chunk_size: usize) -> Self {
        Self {
            enabled,
            max_message_size,
            chunk_size: chunk_size.max(16),
        }
    }

    /// Replace each oversized plain message with its chunk sequence.
    pub fn apply(&self, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        if !self.enabled {
            return messages;
        }

        let mut out = Vec::with_capacity(messages.len());
        for msg in messages {
            if msg.is_tool_result() || msg.has_tool_use() {
                out.push(msg);
                continue;
            }
            let oversized = matches!(&msg.content, MessageContent::Text(t)
                if t.chars().count() > self.max_message_size);
            if oversized {
                out.extend(self.chunk_message(msg));
            } else {
                out.push(msg);
            }
        }
        out
    }

    fn chunk_message(&self, msg: ChatMessage) -> Vec<ChatMessage> {
        let MessageContent::Text(text) = &msg.content else {
            return vec![msg];
        };
        let chunks = chunk_text(text, self.chunk_size);
        let total = chunks.len();
        log::info!(
            "message of {} chars exceeds max_message_size {}, split into {} chunks",
            text.len(),
            self.max_message_size,
            total
        );

        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let mut prefix = format!("[CHUNK {}/{}] ", i + 1, total);
                if i == 0 {
                    prefix.push_str("This message was too large and has been split into chunks. ");
                }
                let mut out = msg.clone();
                out.content = MessageContent::Text(format!("{}{}", prefix, chunk));
                out
            })
            .collect()
    }
}

/// Split `text` into chunks of at most `chunk_size` characters, preferring
/// natural boundaries near the end of each chunk.
pub fn chunk_text(text: &str, chunk_size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let ideal_end = (start + chunk_size).min(chars.len());
        if ideal_end == chars.len() {
            chunks.push(chars[start..].iter().collect());
            break;
        }

        // Search backwards from the ideal end, but not past the midpoint.
        let window: String = chars[start..ideal_end].iter().collect();
        let floor = chunk_size / 2;
        let mut cut = ideal_end;
        for pattern in ["\n\n", "\n", ". ", ", ", " "] {
            if let Some(pos) = window.rfind(pattern) {
                let boundary = window[..pos].chars().count() + pattern.chars().count();
                if boundary > floor {
                    cut = start + boundary;
                    break;
                }
            }
        }

        let chunk: String = chars[start..cut].iter().collect();
        let trimmed = chunk.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }
        start = cut;
    }

    chunks
}
