//! Conversation history management: budget enforcement with pair-preserving
//! eviction.
//!
//! The manager owns two invariants on every snapshot handed to the LLM
//! pipeline:
//!
//! - **Pair integrity** — for every `tool_use` block reachable in the active
//!   history the matching `tool_result` is also present, and vice versa.
//!   Whatever the eviction strategy selects, a shared finalizer expands the
//!   selection to pull in missing mates, drops results whose mate cannot be
//!   kept, and re-verifies before the snapshot leaves this module.
//! - **Budget compliance** — message count stays within
//!   `max_conversation_messages` and serialized size within
//!   `context_limit_chars`.
//!
//! Three eviction strategies are selectable per session: `truncate` (drop
//! oldest), `sliding_window` (system prompt + most recent N), and
//! `smart_prune` (shed tool traffic from older exchanges first, keeping the
//! assistant text as the surviving summary of each pruned exchange; the
//! in-flight trailing turn is always retained).

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::chatbridge::chunker::MessageChunker;
use crate::chatbridge::config::{BridgeConfig, ConversationStrategy};
use crate::chatbridge::message::{ChatMessage, Role};
use crate::chatbridge::truncation::ToolResultTruncator;

/// Manages history trimming and tool-pair integrity for one session.
#[derive(Debug, Clone)]
pub struct ConversationManager {
    max_messages: usize,
    max_chars: usize,
    strategy: ConversationStrategy,
    preserve_system: bool,
    truncator: ToolResultTruncator,
    chunker: MessageChunker,
}

impl ConversationManager {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            max_messages: config.max_conversation_messages,
            max_chars: config.context_limit_chars,
            strategy: config.conversation_strategy,
            preserve_system: config.preserve_system_message,
            truncator: ToolResultTruncator::from_config(config),
            chunker: MessageChunker::from_config(config),
        }
    }

    /// Current eviction strategy.
    pub fn strategy(&self) -> ConversationStrategy {
        self.strategy
    }

    /// True when `messages` exceeds the count or size budget.
    pub fn over_budget(&self, messages: &[ChatMessage]) -> bool {
        messages.len() > self.max_messages || total_size(messages) > self.max_chars
    }

    /// Unconditionally append, then trim the stored history back to budget.
    pub fn append(&self, history: &mut Vec<ChatMessage>, message: ChatMessage) {
        history.push(message);
        if self.over_budget(history) {
            *history = self.manage(std::mem::take(history));
        }
    }

    /// Produce a view of `history` satisfying pair integrity and both budgets.
    ///
    /// Order of operations: chunk oversized plain messages (pre-eviction),
    /// truncate oversized tool results (two tiers), then evict to budget with
    /// the shared pair-preserving finalizer.
    pub fn snapshot_for_llm(&self, history: &[ChatMessage]) -> Vec<ChatMessage> {
        let chunked = self.chunker.apply(history.to_vec());
        let truncated = self.truncator.apply(chunked);
        let managed = self.manage(truncated);
        assert_pair_integrity(&managed);
        managed
    }

    /// Shrink an already-budgeted snapshot further after a context-length
    /// error: re-apply the history tier to every tool result, then evict
    /// against half the message budget with the strategy escalated to
    /// `smart_prune`.
    pub fn shrink_for_retry(&self, snapshot: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let requeued: Vec<ChatMessage> = snapshot
            .into_iter()
            .map(|msg| {
                if msg.is_tool_result() {
                    self.truncator
                        .truncate_with_tier(msg, crate::chatbridge::truncation::TruncationTier::History)
                } else {
                    msg
                }
            })
            .collect();

        let aggressive = Self {
            max_messages: (self.max_messages / 2).max(3),
            max_chars: self.max_chars / 2,
            strategy: ConversationStrategy::SmartPrune,
            preserve_system: self.preserve_system,
            truncator: self.truncator.clone(),
            chunker: self.chunker.clone(),
        };
        let shrunk = aggressive.manage(requeued);
        assert_pair_integrity(&shrunk);
        log::info!("context recovery shrank history to {} messages", shrunk.len());
        shrunk
    }

    /// Trim `messages` to the count and size budgets, preserving tool pairs.
    pub fn manage(&self, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let over_count = messages.len() > self.max_messages;
        let over_size = total_size(&messages) > self.max_chars;
        if !over_count && !over_size {
            // Orphans can still exist if a caller fed us a partial transcript.
            return remove_orphaned_results(messages);
        }

        log::info!(
            "history has {} messages / {} chars, trimming with {:?}",
            messages.len(),
            total_size(&messages),
            self.strategy
        );

        let trimmed = match self.strategy {
            ConversationStrategy::Truncate => self.trim_recent(messages, false),
            ConversationStrategy::SlidingWindow => self.trim_recent(messages, true),
            ConversationStrategy::SmartPrune => self.smart_prune(messages),
        };

        let cleaned = remove_orphaned_results(trimmed);
        log::info!("history trimmed to {} messages", cleaned.len());
        cleaned
    }

    /// `truncate` and `sliding_window`: keep the most recent messages (plus the
    /// system prompt), differing in whether orphaned results in the initial
    /// window are dropped before pair expansion.
    fn trim_recent(&self, messages: Vec<ChatMessage>, drop_initial_orphans: bool) -> Vec<ChatMessage> {
        let (system, rest) = self.split_system(messages);
        let budget = self.remaining_budget(system.is_some());

        let mut selected: BTreeSet<usize> = if rest.len() > budget {
            (rest.len() - budget..rest.len()).collect()
        } else {
            (0..rest.len()).collect()
        };

        let locations = tool_use_locations(&rest);

        if drop_initial_orphans {
            // A result whose assistant mate fell outside the window is removed
            // up front rather than dragging the mate back in.
            let orphaned: Vec<usize> = selected
                .iter()
                .copied()
                .filter(|&i| {
                    rest[i].tool_result_refs().iter().any(|r| {
                        locations
                            .get(*r)
                            .is_some_and(|use_idx| !selected.contains(use_idx))
                    })
                })
                .collect();
            for i in orphaned {
                selected.remove(&i);
            }
        }

        let selected = self.finalize_selection(&rest, selected, &locations, budget);
        rejoin(system, &rest, selected)
    }

    /// `smart_prune`: drop tool traffic from older exchanges first. The
    /// trailing in-flight turn (everything from the last plain user message
    /// on) is always retained.
    fn smart_prune(&self, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let (system, rest) = self.split_system(messages);
        let budget = self.remaining_budget(system.is_some());

        let in_flight_start = rest
            .iter()
            .rposition(|m| m.role == Role::User && !m.is_tool_result())
            .unwrap_or(rest.len());

        // First pass: non-tool messages plus the in-flight turn.
        let lean: BTreeSet<usize> = (0..rest.len())
            .filter(|&i| {
                i >= in_flight_start || (!rest[i].is_tool_result() && !rest[i].has_tool_use())
            })
            .collect();

        let selected: BTreeSet<usize> = if lean.len() > budget {
            // Still over: window the lean selection, never dropping the
            // in-flight turn.
            let keep_from = lean.len() - budget;
            lean.iter()
                .copied()
                .enumerate()
                .filter(|(rank, idx)| *rank >= keep_from || *idx >= in_flight_start)
                .map(|(_, idx)| idx)
                .collect()
        } else {
            lean
        };

        let locations = tool_use_locations(&rest);
        let selected = self.finalize_selection(&rest, selected, &locations, budget);
        rejoin(system, &rest, selected)
    }

    /// Shared finalizer: expand the selection until every kept tool_use has its
    /// result and every kept result has its tool_use; if the expansion blows
    /// the budget, whole pairs are dropped oldest-first; finally enforce the
    /// size budget the same way.
    fn finalize_selection(
        &self,
        messages: &[ChatMessage],
        mut selected: BTreeSet<usize>,
        locations: &HashMap<String, usize>,
        budget: usize,
    ) -> BTreeSet<usize> {
        // Iteratively pull in missing mates.
        let mut changed = true;
        let mut rounds = 0;
        while changed && rounds < 10 {
            changed = false;
            rounds += 1;

            for i in selected.clone() {
                let msg = &messages[i];

                for reference in msg.tool_result_refs() {
                    if let Some(&use_idx) = locations.get(reference) {
                        if selected.insert(use_idx) {
                            changed = true;
                        }
                    }
                }

                if msg.has_tool_use() {
                    for id in msg.tool_use_ids() {
                        if let Some(result_idx) = find_result(messages, i, id) {
                            if selected.insert(result_idx) {
                                changed = true;
                            }
                        }
                    }
                }
            }
        }

        // Budget re-enforcement: drop the oldest selected entry together with
        // its pair partners until both budgets hold.
        loop {
            let count_ok = selected.len() <= budget;
            let size_ok = selected
                .iter()
                .map(|&i| messages[i].content_size())
                .sum::<usize>()
                <= self.max_chars;
            if count_ok && size_ok {
                break;
            }
            let Some(&oldest) = selected.iter().next() else {
                break;
            };
            for idx in pair_partners(messages, oldest, locations) {
                selected.remove(&idx);
            }
            selected.remove(&oldest);
        }

        selected
    }

    fn split_system(&self, mut messages: Vec<ChatMessage>) -> (Option<ChatMessage>, Vec<ChatMessage>) {
        if self.preserve_system
            && messages
                .first()
                .is_some_and(|m| m.role == Role::System)
        {
            let system = messages.remove(0);
            (Some(system), messages)
        } else {
            (None, messages)
        }
    }

    fn remaining_budget(&self, has_system: bool) -> usize {
        if has_system {
            self.max_messages.saturating_sub(1).max(1)
        } else {
            self.max_messages.max(1)
        }
    }
}

/// Map of tool_use id → index of the assistant message carrying it.
fn tool_use_locations(messages: &[ChatMessage]) -> HashMap<String, usize> {
    let mut locations = HashMap::new();
    for (i, msg) in messages.iter().enumerate() {
        for id in msg.tool_use_ids() {
            locations.insert(id.to_string(), i);
        }
    }
    locations
}

/// Find the index of the tool_result answering `tool_use_id`, scanning forward
/// from the assistant message until the next assistant message.
fn find_result(messages: &[ChatMessage], from: usize, tool_use_id: &str) -> Option<usize> {
    for (j, msg) in messages.iter().enumerate().skip(from + 1) {
        if msg.tool_result_refs().contains(&tool_use_id) {
            return Some(j);
        }
        if msg.role == Role::Assistant {
            break;
        }
    }
    None
}

/// All indices forming the tool pair(s) that `index` participates in,
/// excluding `index` itself.
fn pair_partners(
    messages: &[ChatMessage],
    index: usize,
    locations: &HashMap<String, usize>,
) -> Vec<usize> {
    let msg = &messages[index];
    let mut partners = Vec::new();
    for reference in msg.tool_result_refs() {
        if let Some(&use_idx) = locations.get(reference) {
            partners.push(use_idx);
        }
    }
    if msg.has_tool_use() {
        for id in msg.tool_use_ids() {
            if let Some(result_idx) = find_result(messages, index, id) {
                partners.push(result_idx);
            }
        }
    }
    partners
}

fn rejoin(
    system: Option<ChatMessage>,
    rest: &[ChatMessage],
    selected: BTreeSet<usize>,
) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(selected.len() + 1);
    if let Some(system) = system {
        out.push(system);
    }
    for i in selected {
        out.push(rest[i].clone());
    }
    out
}

fn total_size(messages: &[ChatMessage]) -> usize {
    messages.iter().map(|m| m.content_size()).sum()
}

/// Final sweep removing any tool_result whose tool_use is absent.
///
/// Covers all three family shapes; a message whose content was nothing but
/// orphaned results is dropped entirely.
pub fn remove_orphaned_results(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let available: HashSet<String> = messages
        .iter()
        .flat_map(|m| m.tool_use_ids())
        .map(String::from)
        .collect();

    messages
        .into_iter()
        .filter_map(|mut msg| {
            if !msg.is_tool_result() {
                return Some(msg);
            }

            use crate::chatbridge::message::{ContentBlock, MessageContent};
            match &mut msg.content {
                MessageContent::Blocks(blocks) => {
                    let before = blocks.len();
                    blocks.retain(|b| match b {
                        ContentBlock::ToolResult { tool_use_id, .. } => {
                            let keep = available.contains(tool_use_id);
                            if !keep {
                                log::warn!("removing orphaned tool_result {}", tool_use_id);
                            }
                            keep
                        }
                        _ => true,
                    });
                    if blocks.is_empty() && before > 0 {
                        None
                    } else {
                        Some(msg)
                    }
                }
                MessageContent::Text(_) => {
                    let orphaned = msg
                        .tool_call_id
                        .as_deref()
                        .is_some_and(|id| !available.contains(id));
                    if orphaned {
                        log::warn!(
                            "removing orphaned tool_result {:?}",
                            msg.tool_call_id.as_deref()
                        );
                        None
                    } else {
                        Some(msg)
                    }
                }
            }
        })
        .collect()
}

/// Panic on a pair-integrity violation.
///
/// Reaching this with an orphan is a programming error in the eviction logic;
/// it must never be observable outside the process.
pub fn assert_pair_integrity(messages: &[ChatMessage]) {
    let uses: HashSet<&str> = messages.iter().flat_map(|m| m.tool_use_ids()).collect();
    let results: HashSet<&str> = messages.iter().flat_map(|m| m.tool_result_refs()).collect();

    for reference in &results {
        assert!(
            uses.contains(reference),
            "orphaned tool_result {} in active history",
            reference
        );
    }
    for id in &uses {
        assert!(
            results.contains(id),
            "tool_use {} without result in active history",
            id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatbridge::message::ContentBlock;

    fn manager(max_messages: usize) -> ConversationManager {
        let mut config = BridgeConfig::default();
        config.max_conversation_messages = max_messages;
        ConversationManager::from_config(&config)
    }

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

    /// [sys, U1, A1(u), T1(u), U2, A2(v), T2(v), U3] with window 4: the naive
    /// window {U2, A2, T2, U3} keeps A2/T2 paired; nothing is orphaned.
    #[test]
    fn sliding_window_keeps_pairs_together() {
        let history = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("U1"),
            tool_use("u"),
            tool_result("u"),
            ChatMessage::user("U2"),
            tool_use("v"),
            tool_result("v"),
            ChatMessage::user("U3"),
        ];
        let out = manager(4).manage(history);
        assert_pair_integrity(&out);
        assert!(out.len() <= 5); // system + 4 window (pair expansion may keep it tight)
        assert_eq!(out[0].role, Role::System);
    }

    /// Window 2 over the same history initially selects {T2, U3}: T2's mate A2
    /// is outside. The finalizer must reinstate A2 or drop the pair — never
    /// keep T2 alone.
    #[test]
    fn finalizer_never_leaves_result_alone() {
        let history = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("U1"),
            tool_use("u"),
            tool_result("u"),
            ChatMessage::user("U2"),
            tool_use("v"),
            tool_result("v"),
            ChatMessage::user("U3"),
        ];
        let out = manager(2).manage(history);
        assert_pair_integrity(&out);
        let has_t2 = out.iter().any(|m| m.tool_result_refs().contains(&"v"));
        let has_a2 = out.iter().any(|m| m.tool_use_ids().contains(&"v"));
        assert_eq!(has_t2, has_a2, "pair must be kept or dropped together");
    }

    #[test]
    fn append_triggers_trim_to_budget() {
        let mgr = manager(3);
        let mut history = Vec::new();
        for i in 0..10 {
            mgr.append(&mut history, ChatMessage::user(format!("m{}", i)));
            assert!(history.len() <= 3);
        }
        assert_eq!(history.last().unwrap().text(), "m9");
    }

    #[test]
    fn truncate_drops_oldest_first() {
        let history: Vec<ChatMessage> = (0..10)
            .map(|i| ChatMessage::user(format!("m{}", i)))
            .collect();
        let mut config = BridgeConfig::default();
        config.max_conversation_messages = 3;
        config.conversation_strategy = ConversationStrategy::Truncate;
        let out = ConversationManager::from_config(&config).manage(history);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].text(), "m7");
        assert_eq!(out[2].text(), "m9");
    }

    #[test]
    fn smart_prune_sheds_old_tool_traffic_first() {
        let mut config = BridgeConfig::default();
        config.max_conversation_messages = 6;
        config.conversation_strategy = ConversationStrategy::SmartPrune;
        let mgr = ConversationManager::from_config(&config);

        let history = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("U1"),
            tool_use("u"),
            tool_result("u"),
            ChatMessage::assistant("summary of exchange 1"),
            ChatMessage::user("U2"),
            tool_use("v"),
            tool_result("v"),
            ChatMessage::assistant("summary of exchange 2"),
            ChatMessage::user("U3"),
        ];
        let out = mgr.manage(history);
        assert_pair_integrity(&out);
        // older assistant summaries survive; their tool traffic goes first
        assert!(out.iter().any(|m| m.text().contains("exchange 1")));
        assert!(out.iter().any(|m| m.text() == "U3"));
    }

    #[test]
    fn smart_prune_retains_in_flight_turn() {
        let mut config = BridgeConfig::default();
        config.max_conversation_messages = 4;
        config.conversation_strategy = ConversationStrategy::SmartPrune;
        let mgr = ConversationManager::from_config(&config);

        let mut history = vec![ChatMessage::system("sys")];
        for i in 0..10 {
            history.push(ChatMessage::user(format!("old{}", i)));
            history.push(ChatMessage::assistant(format!("re{}", i)));
        }
        // in-flight turn with a pending pair
        history.push(ChatMessage::user("current question"));
        history.push(tool_use("w"));
        history.push(tool_result("w"));

        let out = mgr.manage(history);
        assert_pair_integrity(&out);
        assert!(out.iter().any(|m| m.text() == "current question"));
        assert!(out.iter().any(|m| m.tool_use_ids().contains(&"w")));
        assert!(out.iter().any(|m| m.tool_result_refs().contains(&"w")));
    }

    #[test]
    fn orphan_sweep_handles_gpt_and_llama_shapes() {
        let history = vec![
            ChatMessage::user("q"),
            ChatMessage::gpt_tool_result("ghost", "data"),
            ChatMessage::llama_tool_result("phantom", "data"),
        ];
        let out = remove_orphaned_results(history);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text(), "q");
    }

    #[test]
    fn size_budget_enforced() {
        let mut config = BridgeConfig::default();
        config.max_conversation_messages = 100;
        config.context_limit_chars = 50;
        let mgr = ConversationManager::from_config(&config);

        let history: Vec<ChatMessage> = (0..10)
            .map(|i| ChatMessage::user(format!("{}{}", "x".repeat(20), i)))
            .collect();
        let out = mgr.manage(history);
        assert!(total_size(&out) <= 50);
        assert!(!out.is_empty());
    }

    #[test]
    fn snapshot_satisfies_invariants() {
        let mgr = manager(5);
        let mut history = vec![ChatMessage::system("sys")];
        for i in 0..8 {
            history.push(ChatMessage::user(format!("u{}", i)));
            history.push(tool_use(&format!("id{}", i)));
            history.push(tool_result(&format!("id{}", i)));
            history.push(ChatMessage::assistant(format!("a{}", i)));
        }
        let snapshot = mgr.snapshot_for_llm(&history);
        assert_pair_integrity(&snapshot);
        assert!(snapshot.len() <= 6);
    }
}
