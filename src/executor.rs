//! RVR-B Executor (C6).
//!
//! The per-session control loop: react (call the provider, stream the
//! turn), validate (run any tool calls), reflect (classify failures),
//! backtrack (clean the prompt and retry) — bounded by a two-level
//! circuit breaker and an adaptive termination check. This replaces the
//! teacher's `auto_execute_loop`, generalizing its single-threshold retry
//! into the full classifier/backtrack/circuit-breaker design.

use crate::config::ExecutionThresholds;
use crate::error::{Error, Result, ToolErrorKind};
use crate::intent::IntentAnalyzer;
use crate::provider::{ContentBlockKind, ContentDelta, ProviderRequest, ProviderRouter, StreamEvent};
use crate::selector::{ToolExecutionOutcome, ToolExecutor, ToolSelector};
use crate::types::{Complexity, ContentBlock, IntentResult, IntentSource, Message, SessionState, TextBlock, ToolResultBlock, ToolUseBlock};
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, warn};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One-shot, thread-safe cancel flag observed by the executor before each
/// turn, before each tool call, and polled during streaming assembly.
#[derive(Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-complexity termination bounds. Simple turns get tight bounds;
/// complex turns get more tolerance, per §4.6.
#[derive(Debug, Clone)]
pub struct ExecutorThresholds {
    pub max_turns: u32,
    pub max_duration: Duration,
    pub consecutive_failure_threshold: u32,
}

impl ExecutorThresholds {
    pub fn for_complexity(complexity: Complexity, base: &ExecutionThresholds) -> Self {
        match complexity {
            Complexity::Simple => Self {
                max_turns: 6,
                max_duration: Duration::from_secs(60),
                consecutive_failure_threshold: base.max_consecutive_tool_errors.min(2),
            },
            Complexity::Medium => Self {
                max_turns: 20,
                max_duration: Duration::from_secs(300),
                consecutive_failure_threshold: base.max_consecutive_tool_errors,
            },
            Complexity::Complex => Self {
                max_turns: 60,
                max_duration: Duration::from_secs(1200),
                consecutive_failure_threshold: base.max_consecutive_tool_errors + 2,
            },
        }
    }
}

/// The error classifier's verdict on one failed tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDecision {
    Continue,
    Backtrack,
    FailGracefully,
    Escalate,
}

/// Tabular classifier: maps `{error_kind, repetition, is_safety_flagged}`
/// to a decision. Deliberately not a model call — the cost of consulting
/// a provider on every tool failure would dominate the loop.
#[derive(Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// `previous` is the immediately preceding tool outcome in this turn
    /// sequence, used to detect "the same tool failed twice the same way".
    pub fn classify(&self, current: &ToolExecutionOutcome, previous: Option<&ToolExecutionOutcome>, is_safety_flagged: bool) -> ErrorDecision {
        if is_safety_flagged {
            return ErrorDecision::Escalate;
        }

        let Some(kind) = current.error_kind else {
            return ErrorDecision::Continue;
        };

        let repeated = previous
            .and_then(|p| p.error_kind.map(|prev_kind| p.tool_name == current.tool_name && prev_kind == kind))
            .unwrap_or(false);

        match (kind, repeated) {
            (ToolErrorKind::AuthFailure, true) => ErrorDecision::FailGracefully,
            (_, true) => ErrorDecision::Backtrack,
            (ToolErrorKind::ValidationError, false) => ErrorDecision::Continue,
            (_, false) => ErrorDecision::Continue,
        }
    }
}

/// Level 1 forces a reflection-only turn; level 2 forces graceful
/// termination with a partial-result summary.
pub struct CircuitBreaker {
    consecutive_tool_errors: u32,
    cumulative_backtracks: u32,
    level1_threshold: u32,
    level2_threshold: u32,
}

impl CircuitBreaker {
    pub fn new(level1_threshold: u32, level2_threshold: u32) -> Self {
        Self { consecutive_tool_errors: 0, cumulative_backtracks: 0, level1_threshold, level2_threshold }
    }

    pub fn record_tool_result(&mut self, is_error: bool) {
        if is_error {
            self.consecutive_tool_errors += 1;
        } else {
            self.consecutive_tool_errors = 0;
        }
    }

    pub fn record_backtrack(&mut self) {
        self.cumulative_backtracks += 1;
    }

    pub fn level1_tripped(&self) -> bool {
        self.consecutive_tool_errors >= self.level1_threshold
    }

    pub fn level2_tripped(&self) -> bool {
        self.cumulative_backtracks >= self.level2_threshold
    }
}

/// Why a session run returned control to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    EndTurn,
    MaxTurns,
    MaxDuration,
    ConsecutiveFailures,
    UserStop,
    WantsToStop,
    WantsRollback,
    FailedGracefully,
    Escalated,
    CircuitBreakerLevel2,
    ProviderFailure,
}

#[derive(Debug, Clone)]
pub struct SessionRunOutcome {
    pub state: SessionState,
    pub reason: TerminationReason,
    pub turns: u32,
}

/// The polluting tool_use/tool_result pair for `tool_use_id` is replaced,
/// only in the prompt sent to the model, by a synthetic assistant
/// reflection message. History itself (`full_history`) is untouched so
/// the audit trail retains the truth.
fn clean_context_for_prompt(full_history: &[Message], backtracks: &[(String, String)]) -> Vec<Message> {
    if backtracks.is_empty() {
        return full_history.to_vec();
    }

    let reflections: std::collections::HashMap<&str, &str> = backtracks.iter().map(|(id, reflection)| (id.as_str(), reflection.as_str())).collect();
    let mut inserted: HashSet<&str> = HashSet::new();
    let mut cleaned = Vec::with_capacity(full_history.len());

    for message in full_history {
        let mut kept_blocks = Vec::with_capacity(message.content.len());
        let mut matched_id: Option<&str> = None;

        for block in &message.content {
            match block {
                ContentBlock::ToolUse(tool_use) if reflections.contains_key(tool_use.id.as_str()) => {
                    matched_id = Some(tool_use.id.as_str());
                }
                ContentBlock::ToolResult(tool_result) if reflections.contains_key(tool_result.tool_use_id.as_str()) => {}
                other => kept_blocks.push(other.clone()),
            }
        }

        if let Some(id) = matched_id {
            if inserted.insert(id) {
                cleaned.push(Message::assistant(vec![ContentBlock::Text(TextBlock::new(reflections[id].to_string()))]));
            }
        }

        if !kept_blocks.is_empty() {
            cleaned.push(Message { role: message.role.clone(), content: kept_blocks });
        }
    }

    cleaned
}

/// Derives the goal-restatement block's three fields from the turn so
/// far: the goal is the conversation's original ask (its first user
/// message), progress is the turn counter, and next step is fixed text
/// since this executor has no separate plan-tracking state to draw from.
fn goal_restatement_for(history: &[Message], turn_count: u32, max_turns: u32) -> crate::context::GoalRestatement {
    let goal = history
        .iter()
        .find(|m| m.role == crate::types::MessageRole::User)
        .map(|m| message_text(m))
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| "the user's original request".to_string());

    crate::context::GoalRestatement {
        goal,
        progress: format!("turn {} of at most {max_turns}", turn_count + 1),
        next_step: "continue toward the stated goal, using tools as needed".to_string(),
    }
}

fn message_text(message: &Message) -> String {
    message
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text(text) => Some(text.text.clone()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(" ")
}

enum PendingBlock {
    Text(String),
    Tool { id: String, name: String, args: String },
}

/// Consume a provider's canonical delta stream into the turn's content
/// blocks plus its stop reason. Indices are assigned by each adapter in
/// first-appearance order (0 for text, 1.. for tool calls), so sorting by
/// index recovers the original block order.
async fn assemble_stream_to_blocks(mut stream: BoxStream<'static, Result<StreamEvent>>) -> Result<(Vec<ContentBlock>, Option<String>)> {
    let mut blocks: BTreeMap<usize, PendingBlock> = BTreeMap::new();
    let mut stop_reason = None;

    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::MessageStart | StreamEvent::ContentBlockStop { .. } => {}
            StreamEvent::ContentBlockStart { index, kind } => {
                let pending = match kind {
                    ContentBlockKind::Text => PendingBlock::Text(String::new()),
                    ContentBlockKind::ToolUse { id, name } => PendingBlock::Tool { id, name, args: String::new() },
                };
                blocks.entry(index).or_insert(pending);
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                let entry = blocks.entry(index).or_insert_with(|| PendingBlock::Text(String::new()));
                match (entry, delta) {
                    (PendingBlock::Text(text), ContentDelta::TextDelta(d)) => text.push_str(&d),
                    (PendingBlock::Tool { args, .. }, ContentDelta::ToolInputDelta(d)) => args.push_str(&d),
                    _ => {}
                }
            }
            StreamEvent::MessageDelta { stop_reason: reason } => stop_reason = reason,
            StreamEvent::MessageStop => break,
        }
    }

    let content_blocks = blocks
        .into_values()
        .filter_map(|pending| match pending {
            PendingBlock::Text(text) if !text.is_empty() => Some(ContentBlock::Text(TextBlock::new(text))),
            PendingBlock::Text(_) => None,
            PendingBlock::Tool { id, name, args } => {
                let input = serde_json::from_str(&args).unwrap_or_else(|_| serde_json::json!({}));
                Some(ContentBlock::ToolUse(ToolUseBlock::new(id, name, input)))
            }
        })
        .collect();

    Ok((content_blocks, stop_reason))
}

fn default_intent() -> IntentResult {
    IntentResult {
        complexity: Complexity::Medium,
        skill_groups: HashSet::new(),
        skip_memory: false,
        wants_to_stop: false,
        is_follow_up: false,
        wants_rollback: false,
        source: IntentSource::KeywordFallback,
    }
}

/// Drives one session's conversation through react/validate/reflect/
/// backtrack turns until an adaptive termination signal fires.
pub struct RvrbExecutor {
    router: Arc<ProviderRouter>,
    provider_role: String,
    model: String,
    tool_selector: Arc<ToolSelector>,
    tool_executor: ToolExecutor,
    intent_analyzer: Option<Arc<IntentAnalyzer>>,
    error_classifier: ErrorClassifier,
    base_thresholds: ExecutionThresholds,
    goal_restatement_budget: usize,
}

/// §4.3 Runtime-phase token budget for the goal-restatement block.
const DEFAULT_GOAL_RESTATEMENT_BUDGET: usize = 300;

impl RvrbExecutor {
    pub fn new(
        router: Arc<ProviderRouter>,
        provider_role: impl Into<String>,
        model: impl Into<String>,
        tool_selector: Arc<ToolSelector>,
        base_thresholds: ExecutionThresholds,
    ) -> Self {
        let tool_executor = ToolExecutor::new(tool_selector.clone());
        Self {
            router,
            provider_role: provider_role.into(),
            model: model.into(),
            tool_selector,
            tool_executor,
            intent_analyzer: None,
            error_classifier: ErrorClassifier,
            base_thresholds,
            goal_restatement_budget: DEFAULT_GOAL_RESTATEMENT_BUDGET,
        }
    }

    pub fn with_intent_analyzer(mut self, analyzer: Arc<IntentAnalyzer>) -> Self {
        self.intent_analyzer = Some(analyzer);
        self
    }

    /// Wire pre/post tool-use hooks into every tool call this loop makes,
    /// mirroring `client.rs`'s hook dispatch around its own tool execution.
    pub fn with_hooks(mut self, hooks: Arc<crate::hooks::Hooks>) -> Self {
        self.tool_executor = self.tool_executor.with_hooks(hooks);
        self
    }

    /// Run the session to completion (or interruption). `history` is the
    /// session's persistent, append-only conversation; this function
    /// appends to it as turns complete.
    pub async fn run(&self, agent_id: &str, history: &mut Vec<Message>, cancel: &CancelSignal, allowed_tools: Option<&HashSet<String>>) -> SessionRunOutcome {
        let started_at = Instant::now();
        let mut circuit_breaker = CircuitBreaker::new(self.base_thresholds.max_consecutive_tool_errors, self.base_thresholds.max_cumulative_backtracks);
        let mut backtracks: Vec<(String, String)> = Vec::new();
        let mut turn_count: u32 = 0;
        let mut reflection_only = false;

        loop {
            if cancel.is_set() {
                return SessionRunOutcome { state: SessionState::Stopped, reason: TerminationReason::UserStop, turns: turn_count };
            }

            let intent = match &self.intent_analyzer {
                Some(analyzer) => analyzer.analyze(history).await,
                None => default_intent(),
            };

            if intent.wants_to_stop {
                return SessionRunOutcome { state: SessionState::Stopped, reason: TerminationReason::WantsToStop, turns: turn_count };
            }
            if intent.wants_rollback {
                return SessionRunOutcome { state: SessionState::Stopped, reason: TerminationReason::WantsRollback, turns: turn_count };
            }

            let thresholds = ExecutorThresholds::for_complexity(intent.complexity, &self.base_thresholds);
            let tools = if reflection_only { Vec::new() } else { self.tool_selector.select(agent_id, &intent, allowed_tools) };

            let target = match self.router.pick(&self.provider_role) {
                Ok(target) => target,
                Err(_) => return SessionRunOutcome { state: SessionState::Error, reason: TerminationReason::ProviderFailure, turns: turn_count },
            };

            let mut prompt_messages = clean_context_for_prompt(history, &backtracks);
            let restatement = goal_restatement_for(history, turn_count, thresholds.max_turns);
            crate::context::restate_goal(&mut prompt_messages, &restatement, turn_count as usize, self.goal_restatement_budget);
            let request = ProviderRequest { model: self.model.clone(), messages: prompt_messages, tools, max_tokens: None, temperature: None };

            let stream = match target.adapter.send(request).await {
                Ok(stream) => {
                    self.router.record_success(&target);
                    stream
                }
                Err(Error::Provider(provider_err)) => {
                    self.router.record_failure(&target, &provider_err);
                    return SessionRunOutcome { state: SessionState::Error, reason: TerminationReason::ProviderFailure, turns: turn_count };
                }
                Err(_) => return SessionRunOutcome { state: SessionState::Error, reason: TerminationReason::ProviderFailure, turns: turn_count },
            };

            let (blocks, stop_reason) = match assemble_stream_to_blocks(stream).await {
                Ok(result) => result,
                Err(_) => return SessionRunOutcome { state: SessionState::Error, reason: TerminationReason::ProviderFailure, turns: turn_count },
            };

            let tool_uses: Vec<ToolUseBlock> = blocks
                .iter()
                .filter_map(|b| if let ContentBlock::ToolUse(t) = b { Some(t.clone()) } else { None })
                .collect();

            if tool_uses.is_empty() {
                if !blocks.is_empty() {
                    history.push(Message::assistant(blocks));
                }
                if stop_reason.as_deref() == Some("end_turn") || stop_reason.is_none() {
                    return SessionRunOutcome { state: SessionState::Completed, reason: TerminationReason::EndTurn, turns: turn_count + 1 };
                }
            } else {
                history.push(Message::assistant(blocks));
            }

            let mut previous_outcome: Option<ToolExecutionOutcome> = None;
            let mut tool_results: Vec<ContentBlock> = Vec::with_capacity(tool_uses.len());
            for tool_use in &tool_uses {
                if cancel.is_set() {
                    return SessionRunOutcome { state: SessionState::Stopped, reason: TerminationReason::UserStop, turns: turn_count };
                }

                let outcome = self.tool_executor.execute(tool_use.id.clone(), &tool_use.name, tool_use.input.clone(), history).await;
                circuit_breaker.record_tool_result(outcome.is_error);
                tool_results.push(ContentBlock::ToolResult(ToolResultBlock::new(outcome.tool_use_id.clone(), outcome.result.clone())));

                if outcome.is_error {
                    let is_safety_flagged = self.tool_selector.is_safety_flagged(agent_id, &outcome.tool_name);
                    let decision = self.error_classifier.classify(&outcome, previous_outcome.as_ref(), is_safety_flagged);
                    debug!("tool '{}' failed ({:?}); classifier decision: {decision:?}", outcome.tool_name, outcome.error_kind);
                    match decision {
                        ErrorDecision::Continue => {}
                        ErrorDecision::Backtrack => {
                            circuit_breaker.record_backtrack();
                            let reason = outcome.result.get("error").and_then(|v| v.as_str()).unwrap_or("an unspecified error").to_string();
                            backtracks.push((
                                outcome.tool_use_id.clone(),
                                format!("Approach using '{}' failed because {reason}; attempting a different approach instead.", outcome.tool_name),
                            ));
                        }
                        ErrorDecision::FailGracefully => {
                            warn!("tool '{}' failed persistently; terminating session gracefully", outcome.tool_name);
                            history.push(Message::user_with_blocks(tool_results));
                            return SessionRunOutcome { state: SessionState::Completed, reason: TerminationReason::FailedGracefully, turns: turn_count + 1 };
                        }
                        ErrorDecision::Escalate => {
                            history.push(Message::user_with_blocks(tool_results));
                            return SessionRunOutcome { state: SessionState::WaitingHitl, reason: TerminationReason::Escalated, turns: turn_count + 1 };
                        }
                    }
                }

                previous_outcome = Some(outcome);
            }

            history.push(Message::user_with_blocks(tool_results));

            reflection_only = circuit_breaker.level1_tripped();
            if circuit_breaker.level2_tripped() {
                return SessionRunOutcome { state: SessionState::Error, reason: TerminationReason::CircuitBreakerLevel2, turns: turn_count + 1 };
            }

            turn_count += 1;
            if turn_count >= thresholds.max_turns {
                return SessionRunOutcome { state: SessionState::Error, reason: TerminationReason::MaxTurns, turns: turn_count };
            }
            if started_at.elapsed() > thresholds.max_duration {
                return SessionRunOutcome { state: SessionState::Error, reason: TerminationReason::MaxDuration, turns: turn_count };
            }
            if circuit_breaker.consecutive_tool_errors >= thresholds.consecutive_failure_threshold {
                return SessionRunOutcome { state: SessionState::Error, reason: TerminationReason::ConsecutiveFailures, turns: turn_count };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;
    use crate::types::MessageRole;

    fn outcome(tool_name: &str, is_error: bool, kind: Option<ToolErrorKind>) -> ToolExecutionOutcome {
        ToolExecutionOutcome {
            tool_use_id: "call-1".into(),
            tool_name: tool_name.to_string(),
            result: serde_json::json!({}),
            is_error,
            error_kind: kind,
        }
    }

    #[test]
    fn classifier_escalates_on_safety_flag() {
        let classifier = ErrorClassifier;
        let current = outcome("search", true, Some(ToolErrorKind::ExecutionError));
        assert_eq!(classifier.classify(&current, None, true), ErrorDecision::Escalate);
    }

    #[test]
    fn classifier_backtracks_on_repeated_same_tool_error() {
        let classifier = ErrorClassifier;
        let previous = outcome("search", true, Some(ToolErrorKind::ExecutionError));
        let current = outcome("search", true, Some(ToolErrorKind::ExecutionError));
        assert_eq!(classifier.classify(&current, Some(&previous), false), ErrorDecision::Backtrack);
    }

    #[test]
    fn classifier_fails_gracefully_on_repeated_auth_failure() {
        let classifier = ErrorClassifier;
        let previous = outcome("deploy", true, Some(ToolErrorKind::AuthFailure));
        let current = outcome("deploy", true, Some(ToolErrorKind::AuthFailure));
        assert_eq!(classifier.classify(&current, Some(&previous), false), ErrorDecision::FailGracefully);
    }

    #[test]
    fn classifier_continues_on_first_validation_error() {
        let classifier = ErrorClassifier;
        let current = outcome("search", true, Some(ToolErrorKind::ValidationError));
        assert_eq!(classifier.classify(&current, None, false), ErrorDecision::Continue);
    }

    #[test]
    fn circuit_breaker_trips_level1_after_threshold() {
        let mut cb = CircuitBreaker::new(3, 5);
        cb.record_tool_result(true);
        cb.record_tool_result(true);
        assert!(!cb.level1_tripped());
        cb.record_tool_result(true);
        assert!(cb.level1_tripped());
    }

    #[test]
    fn circuit_breaker_resets_consecutive_errors_on_success() {
        let mut cb = CircuitBreaker::new(3, 5);
        cb.record_tool_result(true);
        cb.record_tool_result(true);
        cb.record_tool_result(false);
        assert!(!cb.level1_tripped());
    }

    #[test]
    fn circuit_breaker_trips_level2_after_cumulative_backtracks() {
        let mut cb = CircuitBreaker::new(3, 2);
        cb.record_backtrack();
        cb.record_backtrack();
        assert!(cb.level2_tripped());
    }

    #[test]
    fn clean_context_replaces_pair_with_reflection_and_preserves_history() {
        let history = vec![
            Message::user("do the thing"),
            Message::assistant(vec![ContentBlock::ToolUse(ToolUseBlock::new("call-1", "deploy", serde_json::json!({})))]),
            Message::user_with_blocks(vec![ContentBlock::ToolResult(ToolResultBlock::new("call-1", serde_json::json!({"error": "boom"})))]),
        ];

        let cleaned = clean_context_for_prompt(&history, &[("call-1".to_string(), "Approach 'deploy' failed; trying something else.".to_string())]);

        assert_eq!(cleaned.len(), 2);
        assert_eq!(cleaned[1].role, MessageRole::Assistant);
        assert!(matches!(&cleaned[1].content[0], ContentBlock::Text(t) if t.text.contains("trying something else")));

        assert_eq!(history.len(), 3, "persistent history must be untouched");
    }

    #[test]
    fn clean_context_is_noop_without_backtracks() {
        let history = vec![Message::user("hello")];
        let cleaned = clean_context_for_prompt(&history, &[]);
        assert_eq!(cleaned.len(), 1);
    }

    #[tokio::test]
    async fn assemble_stream_collects_text_and_tool_use_in_order() {
        use crate::error::Result as CrateResult;
        use futures::stream;

        let events: Vec<CrateResult<StreamEvent>> = vec![
            Ok(StreamEvent::MessageStart),
            Ok(StreamEvent::ContentBlockStart { index: 0, kind: ContentBlockKind::Text }),
            Ok(StreamEvent::ContentBlockDelta { index: 0, delta: ContentDelta::TextDelta("hello".to_string()) }),
            Ok(StreamEvent::ContentBlockStart { index: 1, kind: ContentBlockKind::ToolUse { id: "call-1".to_string(), name: "search".to_string() } }),
            Ok(StreamEvent::ContentBlockDelta { index: 1, delta: ContentDelta::ToolInputDelta("{\"q\":".to_string()) }),
            Ok(StreamEvent::ContentBlockDelta { index: 1, delta: ContentDelta::ToolInputDelta("\"rust\"}".to_string()) }),
            Ok(StreamEvent::ContentBlockStop { index: 0 }),
            Ok(StreamEvent::ContentBlockStop { index: 1 }),
            Ok(StreamEvent::MessageDelta { stop_reason: Some("tool_use".to_string()) }),
            Ok(StreamEvent::MessageStop),
        ];

        let (blocks, stop_reason) = assemble_stream_to_blocks(Box::pin(stream::iter(events))).await.unwrap();
        assert_eq!(stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(blocks.len(), 2);
        assert!(matches!(&blocks[0], ContentBlock::Text(t) if t.text == "hello"));
        assert!(matches!(&blocks[1], ContentBlock::ToolUse(t) if t.name == "search" && t.input["q"] == "rust"));
    }
}
