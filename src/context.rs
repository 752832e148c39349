//! Context management utilities for manual history management
//!
//! This module provides low-level helpers for managing conversation history.
//! These are opt-in utilities - nothing is automatic. You decide when and how
//! to manage context.
//!
//! # Features
//!
//! - Token estimation (character-based approximation)
//! - Message truncation with system prompt preservation
//! - Manual history management patterns
//!
//! # Examples
//!
//! ```rust
//! use agent_exec_core::{estimate_tokens, truncate_messages};
//!
//! // Estimate tokens
//! let messages = vec![/* your messages */];
//! let tokens = estimate_tokens(&messages);
//! println!("Estimated tokens: {}", tokens);
//!
//! // Truncate when needed
//! if tokens > 28000 {
//!     let truncated = truncate_messages(&messages, 10, true);
//!     // Use truncated messages...
//! }
//! ```

use crate::types::{ContentBlock, Message};

/// Estimate token count for message list
///
/// Uses character-based approximation (1 token ≈ 4 characters).
///
/// # Arguments
///
/// * `messages` - List of messages to estimate tokens for
///
/// # Returns
///
/// Estimated token count
///
/// # Note
///
/// This is an APPROXIMATION. Actual token counts vary by model family:
/// - GPT models: ~70-85% accurate (different tokenizers)
/// - Llama, Qwen, Mistral: ~70-85% accurate
/// - Always include 10-20% safety margin when checking limits
///
/// For more accurate estimation, consider using tiktoken bindings
/// (not included to keep dependencies minimal).
///
/// # Examples
///
/// ```rust
/// use agent_exec_core::{Message, MessageRole, estimate_tokens};
///
/// let messages = vec![
///     Message::system("You are a helpful assistant"),
///     Message::user("Hello!"),
/// ];
///
/// let tokens = estimate_tokens(&messages);
/// println!("Estimated tokens: {}", tokens);
///
/// // Check if approaching context limit
/// if tokens > 28000 {
///     println!("Need to truncate!");
/// }
/// ```
pub fn estimate_tokens(messages: &[Message]) -> usize {
    // Character-based approximation: 1 token ≈ 4 characters
    // This is a conservative estimate that works across model families

    if messages.is_empty() {
        return 0;
    }

    let mut total_chars = 0;

    for message in messages {
        // Count role overhead (approximately 1-2 tokens)
        total_chars += 8; // ~2 tokens for role formatting

        // Count content
        for block in &message.content {
            match block {
                crate::types::ContentBlock::Text(text) => {
                    total_chars += text.text.len();
                }
                crate::types::ContentBlock::ToolUse(tool) => {
                    // Tool calls add significant overhead
                    total_chars += tool.name.len();
                    total_chars += tool.id.len();
                    total_chars += tool.input.to_string().len();
                }
                crate::types::ContentBlock::ToolResult(result) => {
                    // Tool results add overhead
                    total_chars += result.tool_use_id.len();
                    total_chars += result.content.to_string().len();
                }
                crate::types::ContentBlock::Image(_) => {
                    // Flat per-image overhead; actual cost depends on the
                    // provider's vision pricing, which this estimator does
                    // not model.
                    total_chars += 340;
                }
            }
        }
    }

    // Add conversation-level overhead (~2-4 tokens)
    total_chars += 16;

    // Convert characters to tokens (4 chars ≈ 1 token, round up for safety)
    (total_chars + 3) / 4 // Ceiling division
}

/// Truncate message history, keeping recent messages
///
/// Always preserves the system prompt (if present) and keeps the most
/// recent N messages. This is a simple truncation - it does NOT attempt
/// to preserve tool chains or important context.
///
/// # Arguments
///
/// * `messages` - List of messages to truncate
/// * `keep` - Number of recent messages to keep (default: 10)
/// * `preserve_system` - Keep system message if present (default: true)
///
/// # Returns
///
/// Truncated message list (new Vec, original unchanged)
///
/// # Examples
///
/// ```rust
/// use agent_exec_core::{Message, Client, truncate_messages, estimate_tokens};
///
/// # async fn example(mut client: Client) {
/// // Manual truncation when needed
/// let tokens = estimate_tokens(client.history());
/// if tokens > 28000 {
///     let truncated = truncate_messages(client.history(), 10, true);
///     *client.history_mut() = truncated;
/// }
/// # }
/// ```
///
/// # Note
///
/// This is a SIMPLE truncation. For domain-specific needs (e.g.,
/// preserving tool call chains, keeping important context), implement
/// your own logic or use this as a starting point.
///
/// Warning: Truncating mid-conversation may remove context that the
/// model needs to properly respond. Use judiciously at natural breakpoints.
pub fn truncate_messages(messages: &[Message], keep: usize, preserve_system: bool) -> Vec<Message> {
    if messages.is_empty() {
        return Vec::new();
    }

    if messages.len() <= keep {
        return messages.to_vec();
    }

    // Check if first message is system prompt
    let has_system = preserve_system
        && !messages.is_empty()
        && messages[0].role == crate::types::MessageRole::System;

    if has_system {
        // Keep system + last N messages
        let mut result = vec![messages[0].clone()];
        if keep > 0 && messages.len() > 1 {
            let start = messages.len().saturating_sub(keep);
            result.extend_from_slice(&messages[start..]);
        }
        result
    } else {
        // Just keep last N messages
        if keep > 0 {
            let start = messages.len().saturating_sub(keep);
            messages[start..].to_vec()
        } else {
            Vec::new()
        }
    }
}

/// Check if history is approaching a token limit
///
/// Convenience function that combines estimation with a threshold check.
///
/// # Arguments
///
/// * `messages` - Messages to check
/// * `limit` - Token limit (e.g., 32000 for a 32k context window)
/// * `margin` - Safety margin as a percentage (default: 0.9 = 90%)
///
/// # Returns
///
/// `true` if estimated tokens exceed limit * margin
///
/// # Examples
///
/// ```rust
/// use agent_exec_core::{is_approaching_limit, Message};
///
/// # fn example(messages: Vec<Message>) {
/// if is_approaching_limit(&messages, 32000, 0.9) {
///     println!("Time to truncate!");
/// }
/// # }
/// ```
pub fn is_approaching_limit(messages: &[Message], limit: usize, margin: f32) -> bool {
    let estimated = estimate_tokens(messages);
    let threshold = (limit as f32 * margin) as usize;
    estimated > threshold
}

// ---------------------------------------------------------------------
// Context Pipeline (C4.3): injector/phase/budget assembly, tool-result
// compression, and progressive history decay.
// ---------------------------------------------------------------------

use crate::types::Conversation;
use serde_json::Value;
use std::collections::BTreeMap;

/// Which of the three assembly phases an injector's output belongs to.
/// Phases are assembled in this order; within a phase, injectors run in
/// descending `priority` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InjectorPhase {
    /// Static identity/instructions. Rarely changes turn to turn —
    /// assembled first so it stays at a stable prefix for provider-side
    /// prompt caching.
    System,
    /// Per-session context (user profile, playbooks, long-term memory).
    UserContext,
    /// Per-turn, changes-every-call content (scratchpad state, the
    /// current plan).
    Runtime,
}

/// How cache-sensitive an injector's output is. Stable output should
/// never embed a timestamp or other per-call variance, since doing so
/// would defeat the provider's prompt cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheClass {
    /// Identical across calls for the same session configuration.
    Stable,
    /// Identical across calls within one session.
    Session,
    /// Varies every call.
    Dynamic,
}

/// A single contributor to the assembled context. Implementations render
/// their slice of the prompt from the conversation state; the pipeline
/// handles ordering, per-injector token budgets, and final assembly.
pub trait ContextInjector: Send + Sync {
    fn name(&self) -> &str;
    fn phase(&self) -> InjectorPhase;
    /// Higher runs first within a phase.
    fn priority(&self) -> i32 {
        0
    }
    fn token_budget(&self) -> usize;
    fn cache_class(&self) -> CacheClass;
    fn render(&self, conversation: &Conversation) -> String;
}

/// Assembles a system message from registered injectors, in phase then
/// priority order, truncating each injector's contribution to its token
/// budget (character-based estimate, consistent with [`estimate_tokens`]).
pub struct ContextPipeline {
    injectors: Vec<Box<dyn ContextInjector>>,
}

impl ContextPipeline {
    pub fn new() -> Self {
        Self { injectors: Vec::new() }
    }

    pub fn register(&mut self, injector: Box<dyn ContextInjector>) {
        self.injectors.push(injector);
    }

    /// Render every registered injector into one system message, ordered
    /// System -> UserContext -> Runtime and, within a phase, by
    /// descending priority. Each section is labeled with its injector
    /// name so Stable sections form an identical byte prefix across
    /// calls when no Stable injector's content has changed.
    pub fn assemble_system_message(&self, conversation: &Conversation) -> Message {
        let mut ordered: Vec<&Box<dyn ContextInjector>> = self.injectors.iter().collect();
        ordered.sort_by(|a, b| a.phase().cmp(&b.phase()).then(b.priority().cmp(&a.priority())));

        let mut sections = Vec::with_capacity(ordered.len());
        for injector in ordered {
            let rendered = injector.render(conversation);
            let truncated = truncate_to_token_budget(&rendered, injector.token_budget());
            sections.push(format!("## {}\n{}", injector.name(), truncated));
        }

        Message::system(sections.join("\n\n"))
    }

    /// Total token budget across all registered injectors, for callers
    /// sizing the rest of the context window around it.
    pub fn total_budget(&self) -> usize {
        self.injectors.iter().map(|i| i.token_budget()).sum()
    }
}

/// The three fields of the Runtime-phase "current goal / progress / next
/// step" block (§4.3 goal restatement).
#[derive(Debug, Clone)]
pub struct GoalRestatement {
    pub goal: String,
    pub progress: String,
    pub next_step: String,
}

/// Boilerplate wording rotates across these equivalent variants so the
/// model doesn't pattern-lock onto identical phrasing turn after turn.
const GOAL_RESTATEMENT_VARIANTS: &[&str] = &[
    "Current goal: {goal}\nProgress so far: {progress}\nNext step: {next_step}",
    "Goal in focus: {goal}\nWhere things stand: {progress}\nWhat's next: {next_step}",
    "Reminder of the objective: {goal}\nProgress: {progress}\nUp next: {next_step}",
];

/// Appends a token-budgeted "current goal / progress / next step" block
/// to the tail of the last user message, exploiting the recency-attention
/// property of LLMs. Unlike the phase-assembled injectors above, this
/// mutates conversation history directly rather than contributing to the
/// system message — `ContextPipeline` has no single place to render it
/// into, so it's applied as its own step right before a turn is sent.
/// `turn_index` selects which boilerplate variant to rotate through. A
/// no-op if `messages` has no user message.
pub fn restate_goal(messages: &mut [Message], restatement: &GoalRestatement, turn_index: usize, token_budget: usize) {
    let Some(last_user) = messages.iter_mut().rev().find(|m| m.role == crate::types::MessageRole::User) else {
        return;
    };

    let template = GOAL_RESTATEMENT_VARIANTS[turn_index % GOAL_RESTATEMENT_VARIANTS.len()];
    let rendered = template.replace("{goal}", &restatement.goal).replace("{progress}", &restatement.progress).replace("{next_step}", &restatement.next_step);
    let truncated = truncate_to_token_budget(&rendered, token_budget);

    last_user.content.push(ContentBlock::Text(crate::types::TextBlock::new(format!("\n---\n{truncated}"))));
}

impl Default for ContextPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Truncate `text` so its estimated token count stays within `budget`,
/// cutting on a character boundary near the budget's byte equivalent
/// (4 chars/token, matching [`estimate_tokens`]'s approximation).
fn truncate_to_token_budget(text: &str, budget: usize) -> String {
    let max_chars = budget.saturating_mul(4);
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}\n[...truncated to fit token budget...]")
}

/// Content-addressed storage for tool results compressed out of the
/// live context window.
pub trait ScratchpadStore: Send + Sync {
    /// Store `content`, returning a content-addressed key.
    fn put(&self, content: &[u8]) -> String;
    fn get(&self, key: &str) -> Option<Vec<u8>>;
}

/// An in-memory scratchpad store, sufficient for a single-process
/// session lifetime.
#[derive(Default)]
pub struct InMemoryScratchpad {
    entries: dashmap::DashMap<String, Vec<u8>>,
}

impl InMemoryScratchpad {
    pub fn new() -> Self {
        Self::default()
    }

    fn content_key(content: &[u8]) -> String {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        content.hash(&mut hasher);
        format!("scratch:{:016x}", hasher.finish())
    }
}

impl ScratchpadStore for InMemoryScratchpad {
    fn put(&self, content: &[u8]) -> String {
        let key = Self::content_key(content);
        self.entries.entry(key.clone()).or_insert_with(|| content.to_vec());
        key
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).map(|v| v.clone())
    }
}

/// Replace a tool result's content with a scratchpad reference once it
/// exceeds `threshold_bytes`, so it stops occupying the live context
/// window. The full content remains retrievable via the returned key.
pub fn compress_tool_result(content: &Value, threshold_bytes: usize, store: &dyn ScratchpadStore) -> Value {
    let serialized = content.to_string();
    if serialized.len() <= threshold_bytes {
        return content.clone();
    }
    let key = store.put(serialized.as_bytes());
    serde_json::json!({
        "scratchpad_ref": key,
        "byte_len": serialized.len(),
    })
}

/// Recursively sort a JSON value's object keys, producing a
/// deterministic serialization independent of field insertion order.
/// Callers are responsible for stripping timestamps and other per-call
/// variance before calling this — sorting keys alone doesn't make
/// volatile content cache-stable.
pub fn cache_stable_serialize(value: &Value) -> String {
    sort_keys(value).to_string()
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map.iter().map(|(k, v)| (k.clone(), sort_keys(v))).collect();
            serde_json::to_value(sorted).unwrap_or(Value::Null)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Apply progressive history decay: the most recent `full_zone` messages
/// stay verbatim, the `fold_zone` messages before that are collapsed
/// into one folded-summary message, and everything older is collapsed
/// into a single terse summary message. This bounds context growth
/// without the all-or-nothing cliff of [`truncate_messages`].
pub fn decay_history(messages: &[Message], full_zone: usize, fold_zone: usize) -> Vec<Message> {
    let total = messages.len();
    if total <= full_zone {
        return messages.to_vec();
    }

    let full_start = total - full_zone;
    let fold_start = full_start.saturating_sub(fold_zone);

    let mut result = Vec::new();

    if fold_start > 0 {
        result.push(Message::system(format!(
            "[{fold_start} earlier message(s) summarized and omitted]"
        )));
    }

    if fold_start < full_start {
        result.push(Message::system(fold_messages(&messages[fold_start..full_start])));
    }

    result.extend_from_slice(&messages[full_start..]);
    result
}

/// Collapse a run of messages into one compact per-message digest line,
/// the "fold" zone's representation between full verbatim and full
/// summary.
fn fold_messages(messages: &[Message]) -> String {
    let mut lines = Vec::with_capacity(messages.len() + 1);
    lines.push(format!("[folded summary of {} message(s)]", messages.len()));
    for message in messages {
        let text: String = message
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text(t) => Some(t.text.clone()),
                ContentBlock::ToolUse(t) => Some(format!("(tool call: {})", t.name)),
                ContentBlock::ToolResult(_) => Some("(tool result)".to_string()),
                ContentBlock::Image(_) => Some("(image)".to_string()),
            })
            .collect::<Vec<_>>()
            .join(" ");
        let snippet: String = text.chars().take(160).collect();
        lines.push(format!("- {:?}: {snippet}", message.role));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentBlock, Message, MessageRole, TextBlock};

    #[test]
    fn test_estimate_tokens_empty() {
        let messages: Vec<Message> = vec![];
        assert_eq!(estimate_tokens(&messages), 0);
    }

    #[test]
    fn test_estimate_tokens_simple() {
        let messages = vec![Message::new(
            MessageRole::User,
            vec![ContentBlock::Text(TextBlock::new("Hello world"))],
        )];

        let tokens = estimate_tokens(&messages);
        // "Hello world" = 11 chars + overhead ≈ 5-8 tokens
        assert!(tokens >= 3 && tokens <= 10);
    }

    #[test]
    fn test_truncate_messages_empty() {
        let messages: Vec<Message> = vec![];
        let truncated = truncate_messages(&messages, 10, true);
        assert_eq!(truncated.len(), 0);
    }

    #[test]
    fn test_truncate_messages_preserve_system() {
        let messages = vec![
            Message::system("System prompt"),
            Message::user("Message 1"),
            Message::user("Message 2"),
            Message::user("Message 3"),
            Message::user("Message 4"),
        ];

        let truncated = truncate_messages(&messages, 2, true);

        // Should have system + last 2 = 3 messages
        assert_eq!(truncated.len(), 3);
        assert_eq!(truncated[0].role, MessageRole::System);
    }

    #[test]
    fn test_truncate_messages_no_preserve() {
        let messages = vec![
            Message::system("System prompt"),
            Message::user("Message 1"),
            Message::user("Message 2"),
            Message::user("Message 3"),
        ];

        let truncated = truncate_messages(&messages, 2, false);

        // Should have only last 2 messages
        assert_eq!(truncated.len(), 2);
        assert_eq!(truncated[0].role, MessageRole::User);
    }

    #[test]
    fn test_truncate_messages_keep_all() {
        let messages = vec![Message::user("Message 1"), Message::user("Message 2")];

        let truncated = truncate_messages(&messages, 10, true);
        assert_eq!(truncated.len(), 2);
    }

    #[test]
    fn test_is_approaching_limit() {
        let messages = vec![Message::user("x".repeat(1000))];

        // ~250 tokens, should not exceed 90% of 1000
        assert!(!is_approaching_limit(&messages, 1000, 0.9));

        // Should exceed 90% of 200
        assert!(is_approaching_limit(&messages, 200, 0.9));
    }

    struct FixedInjector {
        name: &'static str,
        phase: InjectorPhase,
        priority: i32,
        budget: usize,
        text: &'static str,
    }

    impl ContextInjector for FixedInjector {
        fn name(&self) -> &str {
            self.name
        }
        fn phase(&self) -> InjectorPhase {
            self.phase
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn token_budget(&self) -> usize {
            self.budget
        }
        fn cache_class(&self) -> CacheClass {
            CacheClass::Stable
        }
        fn render(&self, _conversation: &Conversation) -> String {
            self.text.to_string()
        }
    }

    #[test]
    fn pipeline_orders_by_phase_then_priority() {
        let mut pipeline = ContextPipeline::new();
        pipeline.register(Box::new(FixedInjector {
            name: "runtime",
            phase: InjectorPhase::Runtime,
            priority: 0,
            budget: 100,
            text: "runtime-content",
        }));
        pipeline.register(Box::new(FixedInjector {
            name: "system-high",
            phase: InjectorPhase::System,
            priority: 10,
            budget: 100,
            text: "system-high-content",
        }));
        pipeline.register(Box::new(FixedInjector {
            name: "system-low",
            phase: InjectorPhase::System,
            priority: 0,
            budget: 100,
            text: "system-low-content",
        }));

        let conversation = Conversation::new();
        let message = pipeline.assemble_system_message(&conversation);
        let ContentBlock::Text(text) = &message.content[0] else {
            panic!("expected text block");
        };
        let high_pos = text.text.find("system-high-content").unwrap();
        let low_pos = text.text.find("system-low-content").unwrap();
        let runtime_pos = text.text.find("runtime-content").unwrap();
        assert!(high_pos < low_pos);
        assert!(low_pos < runtime_pos);
    }

    #[test]
    fn pipeline_truncates_to_token_budget() {
        let mut pipeline = ContextPipeline::new();
        pipeline.register(Box::new(FixedInjector {
            name: "verbose",
            phase: InjectorPhase::System,
            priority: 0,
            budget: 1,
            text: "this text is much longer than a one-token budget allows",
        }));
        let conversation = Conversation::new();
        let message = pipeline.assemble_system_message(&conversation);
        let ContentBlock::Text(text) = &message.content[0] else {
            panic!("expected text block");
        };
        assert!(text.text.contains("truncated"));
    }

    #[test]
    fn compress_tool_result_below_threshold_is_unchanged() {
        let store = InMemoryScratchpad::new();
        let small = serde_json::json!({"ok": true});
        let result = compress_tool_result(&small, 4096, &store);
        assert_eq!(result, small);
    }

    #[test]
    fn compress_tool_result_above_threshold_becomes_reference() {
        let store = InMemoryScratchpad::new();
        let big = serde_json::json!({"data": "x".repeat(100)});
        let result = compress_tool_result(&big, 16, &store);
        let reference = result["scratchpad_ref"].as_str().unwrap();
        let retrieved = store.get(reference).unwrap();
        assert_eq!(String::from_utf8(retrieved).unwrap(), big.to_string());
    }

    #[test]
    fn cache_stable_serialize_is_independent_of_key_order() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(cache_stable_serialize(&a), cache_stable_serialize(&b));
    }

    #[test]
    fn decay_history_keeps_full_zone_verbatim() {
        let messages: Vec<Message> = (0..10).map(|i| Message::user(format!("msg {i}"))).collect();
        let decayed = decay_history(&messages, 3, 4);
        // 1 summary + 1 folded + 3 full = 5
        assert_eq!(decayed.len(), 5);
        let ContentBlock::Text(last) = &decayed.last().unwrap().content[0] else {
            panic!("expected text");
        };
        assert_eq!(last.text, "msg 9");
    }

    #[test]
    fn decay_history_noop_under_full_zone() {
        let messages: Vec<Message> = (0..3).map(|i| Message::user(format!("msg {i}"))).collect();
        let decayed = decay_history(&messages, 5, 4);
        assert_eq!(decayed.len(), 3);
    }

    #[test]
    fn restate_goal_appends_to_last_user_message_only() {
        let mut messages = vec![Message::user("do the thing"), Message::assistant(vec![ContentBlock::Text(TextBlock::new("ok"))]), Message::user("also the other thing")];
        let restatement = GoalRestatement { goal: "finish the report".into(), progress: "halfway".into(), next_step: "write the summary".into() };

        restate_goal(&mut messages, &restatement, 0, 300);

        assert_eq!(messages[0].content.len(), 1, "earlier user message must be untouched");
        assert_eq!(messages[2].content.len(), 2, "last user message gets the appended block");
        let ContentBlock::Text(block) = &messages[2].content[1] else {
            panic!("expected appended text block");
        };
        assert!(block.text.contains("finish the report"));
        assert!(block.text.contains("halfway"));
        assert!(block.text.contains("write the summary"));
    }

    #[test]
    fn restate_goal_rotates_boilerplate_by_turn_index() {
        let restatement = GoalRestatement { goal: "g".into(), progress: "p".into(), next_step: "n".into() };

        let mut first = vec![Message::user("x")];
        restate_goal(&mut first, &restatement, 0, 300);
        let mut second = vec![Message::user("x")];
        restate_goal(&mut second, &restatement, 1, 300);

        let ContentBlock::Text(a) = &first[0].content[1] else { panic!("expected text") };
        let ContentBlock::Text(b) = &second[0].content[1] else { panic!("expected text") };
        assert_ne!(a.text, b.text, "different turn indices should rotate wording");
    }

    #[test]
    fn restate_goal_is_noop_without_a_user_message() {
        let mut messages = vec![Message::system("sys"), Message::assistant(vec![ContentBlock::Text(TextBlock::new("hi"))])];
        let restatement = GoalRestatement { goal: "g".into(), progress: "p".into(), next_step: "n".into() };
        restate_goal(&mut messages, &restatement, 0, 300);
        assert_eq!(messages[1].content.len(), 1);
    }
}
