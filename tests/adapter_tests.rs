//! One internal history, three wire formats: family parity checks.

use chatbridge::message::{ChatMessage, ContentBlock};
use chatbridge::{ModelFamily, SamplingParams};
use serde_json::json;

fn sampling() -> SamplingParams {
    SamplingParams {
        temperature: 0.7,
        max_tokens: 1024,
        top_p: 0.9,
        stop_sequences: vec!["STOP".into()],
    }
}

/// A complete tool exchange in the internal representation.
fn shared_history() -> Vec<ChatMessage> {
    vec![
        ChatMessage::system("You are a bridge."),
        ChatMessage::user("how many users are there?"),
        ChatMessage::assistant_blocks(vec![
            ContentBlock::Text {
                text: "counting".into(),
            },
            ContentBlock::ToolUse {
                id: "u1".into(),
                name: "get_users".into(),
                input: json!({"limit": 100}),
            },
        ]),
    ]
}

fn tools() -> Vec<serde_json::Value> {
    vec![json!({
        "name": "get_users",
        "description": "List users",
        "parameters": {"type": "object", "properties": {"limit": {"type": "integer"}}},
    })]
}

#[test]
fn claude_request_shape() {
    let body = ModelFamily::Claude.format_request(&shared_history(), &tools(), "fallback", &sampling());

    assert_eq!(body["system"], "You are a bridge.");
    assert_eq!(body["anthropic_version"], "bedrock-2023-05-31");
    assert_eq!(body["stop_sequences"][0], "STOP");

    let messages = body["messages"].as_array().unwrap();
    // system excluded from the message list
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1]["content"][1]["type"], "tool_use");
    assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
}

#[test]
fn gpt_request_shape() {
    let body = ModelFamily::Gpt.format_request(&shared_history(), &tools(), "fallback", &sampling());

    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages[0]["role"], "system");
    assert_eq!(messages[0]["content"], "You are a bridge.");

    let assistant = &messages[2];
    assert_eq!(assistant["tool_calls"][0]["function"]["name"], "get_users");
    assert_eq!(body["tools"][0]["type"], "function");
    assert_eq!(body["stop"][0], "STOP");
}

#[test]
fn llama_request_shape() {
    let body = ModelFamily::Llama.format_request(&shared_history(), &tools(), "fallback", &sampling());

    let prompt = body["prompt"].as_str().unwrap();
    assert!(prompt.contains("You are a bridge."));
    assert!(prompt.contains("Tool: get_users"));
    assert!(prompt.contains("how many users are there?"));
    assert_eq!(body["max_gen_len"], 1024);
}

#[test]
fn parsed_tool_requests_agree_across_families() {
    let claude = ModelFamily::Claude.parse_reply(&json!({
        "content": [{"type": "tool_use", "id": "x", "name": "get_users", "input": {"limit": 5}}],
    }));
    let gpt = ModelFamily::Gpt.parse_reply(&json!({
        "choices": [{"message": {"content": null, "tool_calls": [
            {"id": "x", "type": "function",
             "function": {"name": "get_users", "arguments": "{\"limit\":5}"}},
        ]}}],
    }));
    let llama = ModelFamily::Llama.parse_reply(&json!({
        "generation": "<tool_call>get_users({\"limit\": 5})</tool_call>",
    }));

    for reply in [&claude, &gpt, &llama] {
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].name, "get_users");
        assert_eq!(reply.tool_calls[0].arguments["limit"], 5);
    }
}

#[test]
fn terminal_replies_have_no_tool_calls() {
    let reply = ModelFamily::Claude.parse_reply(&json!({
        "content": [{"type": "text", "text": "There are 42 users."}],
        "stop_reason": "end_turn",
    }));
    assert!(!reply.wants_tools());
    assert_eq!(reply.text, "There are 42 users.");
}
