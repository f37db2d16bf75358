//! Benchmark to measure the cost of formatting history into provider wire
//! shapes.
//!
//! Formatting runs once per model round; this demonstrates the conversion
//! overhead is negligible next to network and model latency.
//!
//! Run with: cargo bench --bench format_bench

use std::time::Instant;

use chatbridge::message::{ChatMessage, ContentBlock};
use chatbridge::{ModelFamily, SamplingParams};

fn build_conversation() -> Vec<ChatMessage> {
    let mut history = vec![ChatMessage::system("You are a helpful assistant.")];
    for i in 0..10 {
        history.push(ChatMessage::user(format!(
            "User question {} with a realistic amount of text asking about some API data",
            i
        )));
        history.push(ChatMessage::assistant_blocks(vec![
            ContentBlock::Text {
                text: format!("Looking that up ({})", i),
            },
            ContentBlock::ToolUse {
                id: format!("call-{}", i),
                name: "get_users".into(),
                input: serde_json::json!({"limit": 25, "offset": i * 25}),
            },
        ]));
        history.push(ChatMessage::tool_result_blocks(vec![
            ContentBlock::ToolResult {
                tool_use_id: format!("call-{}", i),
                content: serde_json::json!([{"id": i, "name": "someone"}]).to_string(),
                is_error: false,
            },
        ]));
        history.push(ChatMessage::assistant(format!("Here is page {}.", i)));
    }
    history
}

fn main() {
    let history = build_conversation();
    let tools = vec![serde_json::json!({
        "name": "get_users",
        "description": "List users",
        "parameters": {"type": "object", "properties": {
            "limit": {"type": "integer"}, "offset": {"type": "integer"},
        }},
    })];
    let sampling = SamplingParams {
        temperature: 0.7,
        max_tokens: 4096,
        top_p: 0.9,
        stop_sequences: vec![],
    };

    const ITERATIONS: usize = 10_000;

    for family in [ModelFamily::Claude, ModelFamily::Gpt, ModelFamily::Llama] {
        let start = Instant::now();
        let mut total_bytes = 0usize;
        for _ in 0..ITERATIONS {
            let body = family.format_request(&history, &tools, "fallback prompt", &sampling);
            total_bytes += body.to_string().len();
        }
        let elapsed = start.elapsed();
        println!(
            "{:?}: {} iterations in {:?} ({:.1} µs/format, {} bytes/payload)",
            family,
            ITERATIONS,
            elapsed,
            elapsed.as_micros() as f64 / ITERATIONS as f64,
            total_bytes / ITERATIONS,
        );
    }
}
