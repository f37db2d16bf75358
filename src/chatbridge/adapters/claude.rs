//! Claude-family adapter: block-structured messages, out-of-band system text.

use serde_json::{json, Value};

use crate::chatbridge::adapters::SamplingParams;
use crate::chatbridge::invoker::{ModelReply, ToolCallRequest};
use crate::chatbridge::message::{ChatMessage, ContentBlock, MessageContent, Role};

/// Build a Claude request body.
///
/// The system message rides in the top-level `system` field; assistant
/// messages nest `tool_use` blocks and user messages nest `tool_result`
/// blocks inside their content arrays.
pub fn format_request(
    messages: &[ChatMessage],
    tools: &[Value],
    system_prompt: &str,
    sampling: &SamplingParams,
) -> Value {
    let mut system = system_prompt.to_string();
    let mut wire_messages = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => {
                system = msg.text();
            }
            Role::Assistant => wire_messages.push(json!({
                "role": "assistant",
                "content": content_to_wire(&msg.content),
            })),
            Role::User => wire_messages.push(json!({
                "role": "user",
                "content": content_to_wire(&msg.content),
            })),
            // GPT-shaped tool messages can appear after a mid-session family
            // switch; re-nest them as user tool_result blocks.
            Role::Tool => {
                let id = msg.tool_call_id.clone().unwrap_or_default();
                wire_messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": id,
                        "content": msg.text(),
                    }],
                }));
            }
        }
    }

    let mut body = json!({
        "anthropic_version": "bedrock-2023-05-31",
        "max_tokens": sampling.max_tokens,
        "temperature": sampling.temperature,
        "system": system,
        "messages": wire_messages,
    });

    if !sampling.stop_sequences.is_empty() {
        body["stop_sequences"] = json!(sampling.stop_sequences);
    }
    if !tools.is_empty() {
        let wire_tools: Vec<Value> = tools
            .iter()
            .map(|f| {
                json!({
                    "name": f.get("name").cloned().unwrap_or(Value::Null),
                    "description": f.get("description").cloned().unwrap_or(Value::Null),
                    "input_schema": f.get("parameters").cloned().unwrap_or(Value::Null),
                })
            })
            .collect();
        body["tools"] = Value::Array(wire_tools);
    }

    body
}

fn content_to_wire(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(text) => Value::String(text.clone()),
        MessageContent::Blocks(blocks) => Value::Array(
            blocks
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => json!({"type": "text", "text": text}),
                    ContentBlock::ToolUse { id, name, input } => json!({
                        "type": "tool_use", "id": id, "name": name, "input": input,
                    }),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        let mut v = json!({
                            "type": "tool_result",
                            "tool_use_id": tool_use_id,
                            "content": content,
                        });
                        if *is_error {
                            v["is_error"] = json!(true);
                        }
                        v
                    }
                })
                .collect(),
        ),
    }
}

/// Parse a Claude reply: text blocks concatenate, tool_use blocks become
/// [`ToolCallRequest`]s.
pub fn parse_reply(raw: &Value) -> ModelReply {
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    if let Some(content) = raw.get("content").and_then(Value::as_array) {
        for item in content {
            match item.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(t) = item.get("text").and_then(Value::as_str) {
                        text.push_str(t);
                    }
                }
                Some("tool_use") => {
                    tool_calls.push(ToolCallRequest {
                        id: item
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        name: item
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        arguments: item.get("input").cloned().unwrap_or(json!({})),
                    });
                }
                _ => {}
            }
        }
    }

    ModelReply {
        text,
        tool_calls,
        stop_reason: raw
            .get("stop_reason")
            .and_then(Value::as_str)
            .map(String::from),
    }
}
