//! GPT-style adapter: flat message list with `tool_calls` arrays and
//! tool-role result messages.
//!
//! Text is sanitised before formatting — zero-width and control characters
//! trip the tokenizer on some GPT-OSS deployments.

use serde_json::{json, Value};

use crate::chatbridge::adapters::SamplingParams;
use crate::chatbridge::invoker::{ModelReply, ToolCallRequest};
use crate::chatbridge::message::{ChatMessage, ContentBlock, MessageContent, Role};

/// Build a GPT-style request body.
pub fn format_request(
    messages: &[ChatMessage],
    tools: &[Value],
    system_prompt: &str,
    sampling: &SamplingParams,
) -> Value {
    let mut wire_messages = Vec::new();

    let has_system = messages.iter().any(|m| m.role == Role::System);
    if !has_system {
        wire_messages.push(json!({"role": "system", "content": sanitize_text(system_prompt)}));
    }

    for msg in messages {
        match msg.role {
            Role::System => {
                wire_messages.push(json!({"role": "system", "content": sanitize_text(&msg.text())}));
            }
            Role::User => {
                wire_messages.push(json!({"role": "user", "content": sanitize_text(&msg.text())}));
            }
            Role::Assistant => {
                let mut wire = json!({
                    "role": "assistant",
                    "content": sanitize_text(&msg.text()),
                });
                let tool_calls = assistant_tool_calls(&msg.content);
                if !tool_calls.is_empty() {
                    wire["tool_calls"] = Value::Array(tool_calls);
                }
                wire_messages.push(wire);
            }
            Role::Tool => {
                wire_messages.push(json!({
                    "role": "tool",
                    "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
                    "content": sanitize_text(&msg.text()),
                }));
            }
        }
    }

    let mut body = json!({
        "messages": wire_messages,
        "max_tokens": sampling.max_tokens,
        "temperature": sampling.temperature,
        "top_p": sampling.top_p,
    });

    if !sampling.stop_sequences.is_empty() {
        body["stop"] = json!(sampling.stop_sequences);
    }
    if !tools.is_empty() {
        let wire_tools: Vec<Value> = tools
            .iter()
            .map(|f| {
                json!({
                    "type": "function",
                    "function": {
                        "name": f.get("name").cloned().unwrap_or(Value::Null),
                        "description": f.get("description").cloned().unwrap_or(Value::Null),
                        "parameters": f.get("parameters").cloned().unwrap_or(Value::Null),
                    },
                })
            })
            .collect();
        body["tools"] = Value::Array(wire_tools);
    }

    body
}

fn assistant_tool_calls(content: &MessageContent) -> Vec<Value> {
    let MessageContent::Blocks(blocks) = content else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some(json!({
                "id": id,
                "type": "function",
                "function": {
                    "name": name,
                    "arguments": input.to_string(),
                },
            })),
            _ => None,
        })
        .collect()
}

/// Parse a GPT-style reply: `choices[0].message` with optional `tool_calls`
/// whose arguments arrive as a JSON-encoded string.
pub fn parse_reply(raw: &Value) -> ModelReply {
    let Some(message) = raw
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
    else {
        return ModelReply::default();
    };

    let text = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            if call.get("type").and_then(Value::as_str) != Some("function") {
                continue;
            }
            let function = call.get("function").cloned().unwrap_or(json!({}));
            let arguments = function
                .get("arguments")
                .and_then(Value::as_str)
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or(json!({}));
            tool_calls.push(ToolCallRequest {
                id: call
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: function
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                arguments,
            });
        }
    }

    ModelReply {
        text,
        tool_calls,
        stop_reason: raw
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("finish_reason"))
            .and_then(Value::as_str)
            .map(String::from),
    }
}

/// Drop characters that are known to break GPT-OSS tokenization: zero-width
/// joiners, BOMs, and control characters other than newline/tab/CR. Common
/// space variants collapse to plain spaces.
pub fn sanitize_text(text: &str) -> String {
    text.chars()
        .filter_map(|c| match c {
            '\u{202f}' | '\u{00a0}' | '\u{2009}' => Some(' '),
            '\u{200b}' | '\u{200c}' | '\u{200d}' | '\u{feff}' | '\u{2060}' | '\u{2061}' => None,
            c if c.is_control() && c != '\n' && c != '\t' && c != '\r' => None,
            c => Some(c),
        })
        .collect()
}
