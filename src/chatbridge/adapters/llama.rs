//! Llama-family adapter: special-token prompt string, `<tool_call>` markers.
//!
//! Llama has no native tool-calling surface; tool definitions ride in the
//! system text and the model answers with
//! `<tool_call>name({"arg": "value"})</tool_call>` markers that are scanned
//! out of the generation. Tool results return as user messages wrapped in
//! `<tool_result>` tags and flagged with the out-of-band `is_tool_result`
//! marker so the conversation manager can still recognise them.

use serde_json::{json, Value};

use crate::chatbridge::adapters::SamplingParams;
use crate::chatbridge::invoker::{ModelReply, ToolCallRequest};
use crate::chatbridge::message::{ChatMessage, Role};

const TOOL_CALL_OPEN: &str = "<tool_call>";
const TOOL_CALL_CLOSE: &str = "</tool_call>";

/// Build a Llama request body from the special-token prompt format.
pub fn format_request(
    messages: &[ChatMessage],
    tools: &[Value],
    system_prompt: &str,
    sampling: &SamplingParams,
) -> Value {
    let mut prompt = String::from("<|begin_of_text|>");

    let mut system = system_prompt.to_string();
    if let Some(msg) = messages.iter().find(|m| m.role == Role::System) {
        system = msg.text();
    }
    if !tools.is_empty() {
        system.push_str(&tool_instructions(tools));
    }
    push_block(&mut prompt, "system", &system);

    for msg in messages {
        match msg.role {
            Role::System => {}
            Role::User if msg.is_tool_result() => {
                push_block(
                    &mut prompt,
                    "user",
                    &format!("<tool_result>\n{}\n</tool_result>", msg.text()),
                );
            }
            Role::User => push_block(&mut prompt, "user", &msg.text()),
            Role::Assistant => push_block(&mut prompt, "assistant", &msg.text()),
            Role::Tool => {
                push_block(
                    &mut prompt,
                    "user",
                    &format!("<tool_result>\n{}\n</tool_result>", msg.text()),
                );
            }
        }
    }

    prompt.push_str("<|start_header_id|>assistant<|end_header_id|>");

    json!({
        "prompt": prompt,
        "max_gen_len": sampling.max_tokens,
        "temperature": sampling.temperature,
        "top_p": sampling.top_p,
    })
}

fn push_block(prompt: &mut String, role: &str, content: &str) {
    prompt.push_str("<|start_header_id|>");
    prompt.push_str(role);
    prompt.push_str("<|end_header_id|>\n");
    prompt.push_str(content);
    prompt.push_str("<|eot_id|>");
}

fn tool_instructions(tools: &[Value]) -> String {
    let mut out = String::from("\n\nYou have access to the following tools:\n");
    let mut names = Vec::new();
    for tool in tools {
        let name = tool.get("name").and_then(Value::as_str).unwrap_or("unknown");
        names.push(name.to_string());
        out.push_str(&format!("\nTool: {}\n", name));
        if let Some(desc) = tool.get("description").and_then(Value::as_str) {
            out.push_str(&format!("Description: {}\n", desc));
        }
        if let Some(params) = tool.get("parameters") {
            out.push_str(&format!("Parameters: {}\n", params));
        }
    }
    out.push_str("\nWhen you need to call a tool, use this exact format:\n");
    out.push_str("<tool_call>function_name({\"param1\": \"value1\"})</tool_call>\n");
    out.push_str(&format!("Available tool names: {}\n", names.join(", ")));
    out
}

/// Parse a Llama reply, scanning the generation for `<tool_call>` markers.
///
/// Text before the first marker is kept as readable content; when the
/// generation starts with a marker the full text is retained so the model can
/// see its own request on the next turn.
pub fn parse_reply(raw: &Value) -> ModelReply {
    let generation = raw
        .get("generation")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim_start();

    let mut tool_calls = Vec::new();
    let mut content = generation.to_string();

    if let Some(first) = generation.find(TOOL_CALL_OPEN) {
        if first > 0 {
            content = generation[..first].trim().to_string();
        }

        let mut rest = generation;
        while let Some(start) = rest.find(TOOL_CALL_OPEN) {
            let after_open = &rest[start + TOOL_CALL_OPEN.len()..];
            let Some(end) = after_open.find(TOOL_CALL_CLOSE) else {
                break;
            };
            let inner = &after_open[..end];
            if let Some(call) = parse_call(inner, tool_calls.len()) {
                tool_calls.push(call);
            } else {
                log::warn!("failed to parse tool call body: {:?}", inner);
            }
            rest = &after_open[end + TOOL_CALL_CLOSE.len()..];
        }
    }

    ModelReply {
        text: content,
        tool_calls,
        stop_reason: raw
            .get("stop_reason")
            .and_then(Value::as_str)
            .map(String::from),
    }
}

/// Parse `name({...})` into a [`ToolCallRequest`] with a synthesised id.
fn parse_call(inner: &str, index: usize) -> Option<ToolCallRequest> {
    let open = inner.find('(')?;
    let close = inner.rfind(')')?;
    if close < open {
        return None;
    }
    let name = inner[..open].trim();
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }
    let args_str = inner[open + 1..close].trim();
    let arguments = if args_str.is_empty() {
        json!({})
    } else {
        serde_json::from_str(args_str).ok()?
    };
    Some(ToolCallRequest {
        id: format!("llama-tool-{}", index),
        name: name.to_string(),
        arguments,
    })
}
