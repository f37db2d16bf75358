//! Pair-preserving eviction and snapshot invariants across strategies.

use chatbridge::conversation::assert_pair_integrity;
use chatbridge::message::{ChatMessage, ContentBlock};
use chatbridge::{BridgeConfig, ConversationManager, ConversationStrategy};

fn tool_use(id: &str) -> ChatMessage {
    ChatMessage::assistant_blocks(vec![ContentBlock::ToolUse {
        id: id.into(),
        name: "get_users".into(),
        input: serde_json::json!({}),
    }])
}

fn tool_result(id: &str) -> ChatMessage {
    ChatMessage::tool_result_blocks(vec![ContentBlock::ToolResult {
        tool_use_id: id.into(),
        content: "ok".into(),
        is_error: false,
    }])
}

fn manager(strategy: ConversationStrategy, max_messages: usize) -> ConversationManager {
    let mut config = BridgeConfig::default();
    config.conversation_strategy = strategy;
    config.max_conversation_messages = max_messages;
    ConversationManager::from_config(&config)
}

fn paired_history() -> Vec<ChatMessage> {
    vec![
        ChatMessage::system("sys"),
        ChatMessage::user("U1"),
        tool_use("u"),
        tool_result("u"),
        ChatMessage::user("U2"),
        tool_use("v"),
        tool_result("v"),
        ChatMessage::user("U3"),
    ]
}

#[test]
fn every_strategy_upholds_pair_integrity_at_every_window() {
    for strategy in [
        ConversationStrategy::Truncate,
        ConversationStrategy::SlidingWindow,
        ConversationStrategy::SmartPrune,
    ] {
        for window in 2..=8 {
            let out = manager(strategy, window).manage(paired_history());
            assert_pair_integrity(&out);
            assert!(
                out.len() <= window + 1,
                "{:?} window {} produced {} messages",
                strategy,
                window,
                out.len()
            );
        }
    }
}

#[test]
fn snapshot_never_orphans_under_churn() {
    let mgr = manager(ConversationStrategy::SlidingWindow, 7);
    let mut history = vec![ChatMessage::system("system prompt")];

    for turn in 0..30 {
        history.push(ChatMessage::user(format!("question {}", turn)));
        let id = format!("call-{}", turn);
        history.push(tool_use(&id));
        history.push(tool_result(&id));
        history.push(ChatMessage::assistant(format!("answer {}", turn)));

        let snapshot = mgr.snapshot_for_llm(&history);
        assert_pair_integrity(&snapshot);
        assert!(snapshot.len() <= 8);
        // most recent turn always present
        assert!(snapshot
            .iter()
            .any(|m| m.text().contains(&format!("answer {}", turn))));
    }
}

#[test]
fn mixed_family_shapes_evicted_uniformly() {
    // GPT-shaped pair, Llama-shaped pair, Claude-shaped pair, interleaved.
    let history = vec![
        ChatMessage::system("sys"),
        ChatMessage::user("q1"),
        tool_use("claude-1"),
        tool_result("claude-1"),
        ChatMessage::user("q2"),
        tool_use("gpt-1"),
        ChatMessage::gpt_tool_result("gpt-1", "gpt payload"),
        ChatMessage::user("q3"),
        tool_use("llama-1"),
        ChatMessage::llama_tool_result("llama-1", "llama payload"),
        ChatMessage::user("q4"),
    ];

    for window in 2..=10 {
        let out = manager(ConversationStrategy::SlidingWindow, window).manage(history.clone());
        assert_pair_integrity(&out);
    }
}

#[test]
fn shrink_for_retry_halves_and_stays_consistent() {
    let mgr = manager(ConversationStrategy::SlidingWindow, 20);
    let mut history = Vec::new();
    history.push(ChatMessage::system("sys"));
    for i in 0..15 {
        history.push(ChatMessage::user(format!("u{}", i)));
        let id = format!("t{}", i);
        history.push(tool_use(&id));
        history.push(tool_result(&id));
    }

    let snapshot = mgr.snapshot_for_llm(&history);
    let shrunk = mgr.shrink_for_retry(snapshot.clone());
    assert_pair_integrity(&shrunk);
    assert!(shrunk.len() < snapshot.len());
}

#[test]
fn under_budget_history_passes_through() {
    let mgr = manager(ConversationStrategy::SlidingWindow, 50);
    let history = paired_history();
    let out = mgr.manage(history.clone());
    assert_eq!(out.len(), history.len());
}
