//! Tool Selector & Executor (C5).
//!
//! Selection runs three ordered layers over the capability registry: the
//! core layer (always included), the intent-matched layer (tag overlap
//! with the turn's skill groups), and an optional whitelist filter. A
//! `simple` turn skips tag matching entirely and gets a small, fixed set.
//! Execution wraps every tool call so failures surface as a typed
//! [`ToolError`] instead of propagating as `anyhow`-style strings.

use crate::capability::SharedCapabilityRegistry;
use crate::error::{ToolError, ToolErrorKind};
use crate::hooks::{Hooks, PostToolUseEvent, PreToolUseEvent};
use crate::tools::Tool;
use crate::types::{Complexity, IntentResult, Message};
use dashmap::DashMap;
use log::warn;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Hard cap on tool count for `complexity == simple` turns, independent
/// of tag matching.
const SIMPLE_TOOL_CAP: usize = 4;

const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

/// How a tool's handler actually reaches its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// In-process call through [`Tool::execute`].
    Direct,
    /// HTTP POST of the tool's input to its registered endpoint.
    Programmatic,
    /// In-process call whose result is also reported as it becomes
    /// available, via the caller-supplied progress sink.
    Streaming,
}

/// Selects which tools a turn may call, from the capabilities the
/// registry reports plus whatever concrete [`Tool`] implementations have
/// been registered under the same name.
pub struct ToolSelector {
    capabilities: SharedCapabilityRegistry,
    tools: DashMap<String, Arc<Tool>>,
}

impl ToolSelector {
    pub fn new(capabilities: SharedCapabilityRegistry) -> Self {
        Self { capabilities, tools: DashMap::new() }
    }

    pub fn register_tool(&self, tool: Arc<Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Whether `tool_name`'s capability is tagged `safety` for `agent_id` —
    /// the signal the RVR-B executor's error classifier escalates on
    /// regardless of error kind or repetition. `false` for a tool with no
    /// registered capability, rather than failing closed on an unknown name.
    pub fn is_safety_flagged(&self, agent_id: &str, tool_name: &str) -> bool {
        self.capabilities.resolve(agent_id, tool_name).is_some_and(|capability| capability.tags.contains("safety"))
    }

    pub fn find_tool(&self, name: &str) -> Option<Arc<Tool>> {
        self.tools.get(name).map(|entry| entry.clone())
    }

    /// Run the three-layer selection for `agent_id`, returning the tools
    /// the turn may call. `allowed_tools` is the whitelist from an agent
    /// schema or plan, if any.
    pub fn select(&self, agent_id: &str, intent: &IntentResult, allowed_tools: Option<&HashSet<String>>) -> Vec<Arc<Tool>> {
        let capabilities = self.capabilities.all_for(agent_id);

        let core: Vec<_> = capabilities.iter().filter(|c| c.level == 1).collect();
        let intent_matched: Vec<_> = capabilities
            .iter()
            .filter(|c| c.level != 1 && !c.tags.is_disjoint(&intent.skill_groups))
            .collect();

        let mut selected_names: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for capability in core.iter().chain(intent_matched.iter()) {
            if seen.insert(capability.name.clone()) {
                selected_names.push(capability.name.clone());
            }
        }

        if intent.complexity == Complexity::Simple {
            selected_names.truncate(SIMPLE_TOOL_CAP);
        }

        if let Some(whitelist) = allowed_tools {
            selected_names.retain(|name| whitelist.contains(name));
        }

        selected_names
            .into_iter()
            .filter_map(|name| {
                let tool = self.find_tool(&name);
                if tool.is_none() {
                    warn!("capability '{name}' has no registered tool implementation; dropping from selection");
                }
                tool
            })
            .collect()
    }
}

/// Outcome of one tool invocation, already classified so the RVR-B
/// executor's error classifier never has to parse error strings.
#[derive(Debug, Clone)]
pub struct ToolExecutionOutcome {
    pub tool_use_id: String,
    pub tool_name: String,
    pub result: Value,
    pub is_error: bool,
    pub error_kind: Option<ToolErrorKind>,
}

/// Invokes tools sequentially within a turn (parallelism is an explicit
/// non-goal) and normalizes every failure mode into a [`ToolError`].
pub struct ToolExecutor {
    selector: Arc<ToolSelector>,
    timeout: Duration,
    hooks: Option<Arc<Hooks>>,
    http_client: reqwest::Client,
    progress: Option<tokio::sync::mpsc::UnboundedSender<ToolExecutionOutcome>>,
}

impl ToolExecutor {
    pub fn new(selector: Arc<ToolSelector>) -> Self {
        Self { selector, timeout: DEFAULT_EXECUTION_TIMEOUT, hooks: None, http_client: reqwest::Client::new(), progress: None }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Generalizes `client.rs`'s inline pre/post tool-use hook dispatch to
    /// the typed `ToolExecutionOutcome` this executor returns.
    pub fn with_hooks(mut self, hooks: Arc<Hooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// A `Streaming`-strategy tool publishes its outcome on `sink` in
    /// addition to returning it, so a caller can forward it onto the
    /// turn's event stream as it becomes available rather than only
    /// after the whole turn resolves.
    pub fn with_progress_sink(mut self, sink: tokio::sync::mpsc::UnboundedSender<ToolExecutionOutcome>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// `history` is passed through to hook handlers as read-only context;
    /// it never affects selection or execution itself.
    pub async fn execute(&self, tool_use_id: impl Into<String>, name: &str, input: Value, history: &[Message]) -> ToolExecutionOutcome {
        let tool_use_id = tool_use_id.into();

        let Some(tool) = self.selector.find_tool(name) else {
            let err = ToolError::not_found(name);
            return failure_outcome(tool_use_id, name, err);
        };

        let mut input = input;
        if let Some(hooks) = &self.hooks {
            let history_snapshot: Vec<Value> = history.iter().map(|m| serde_json::to_value(m).unwrap_or(Value::Null)).collect();
            let pre_event = PreToolUseEvent::new(name.to_string(), input.clone(), tool_use_id.clone(), history_snapshot.clone());
            if let Some(decision) = hooks.execute_pre_tool_use(pre_event).await {
                if !decision.continue_execution {
                    let reason = decision.reason.unwrap_or_else(|| "blocked by pre_tool_use hook".to_string());
                    return failure_outcome(tool_use_id, name, ToolError::validation(name, reason));
                }
                if let Some(modified) = decision.modified_input {
                    input = modified;
                }
            }

            let mut outcome = self.run_tool(tool_use_id.clone(), name, input.clone(), &tool).await;

            let post_event = PostToolUseEvent::new(name.to_string(), input, tool_use_id.clone(), outcome.result.clone(), history_snapshot);
            if let Some(decision) = hooks.execute_post_tool_use(post_event).await {
                if let Some(modified) = decision.modified_input {
                    outcome.result = modified;
                }
            }
            return outcome;
        }

        self.run_tool(tool_use_id, name, input, &tool).await
    }

    /// Dispatches on [`ExecutionStrategy`]: `Programmatic` tools never
    /// touch `Tool::execute` at all, going over HTTP to their registered
    /// endpoint instead; `Direct` and `Streaming` both call the handler
    /// in-process, but a `Streaming` tool's outcome is also published to
    /// `self.progress`, if one is configured.
    async fn run_tool(&self, tool_use_id: String, name: &str, input: Value, tool: &Arc<Tool>) -> ToolExecutionOutcome {
        let strategy = tool.strategy();

        let outcome = match strategy {
            ExecutionStrategy::Programmatic => self.run_programmatic(tool_use_id, name, input, tool).await,
            ExecutionStrategy::Direct | ExecutionStrategy::Streaming => match tokio::time::timeout(self.timeout, tool.execute(input)).await {
                Err(_) => failure_outcome(tool_use_id, name, ToolError::timeout(name)),
                Ok(Ok(value)) => ToolExecutionOutcome { tool_use_id, tool_name: name.to_string(), result: value, is_error: false, error_kind: None },
                Ok(Err(crate::error::Error::Tool(tool_err))) => failure_outcome(tool_use_id, name, tool_err),
                Ok(Err(other)) => failure_outcome(tool_use_id, name, ToolError::new(name, ToolErrorKind::ExecutionError, other.to_string())),
            },
        };

        if strategy == ExecutionStrategy::Streaming {
            if let Some(sink) = &self.progress {
                let _ = sink.send(outcome.clone());
            }
        }

        outcome
    }

    /// Posts `input` as JSON to the tool's registered endpoint and treats
    /// the response body as the result. A tool marked `Programmatic` with
    /// no endpoint configured fails closed with a `ValidationError`
    /// rather than silently falling back to an in-process call.
    async fn run_programmatic(&self, tool_use_id: String, name: &str, input: Value, tool: &Arc<Tool>) -> ToolExecutionOutcome {
        let Some(endpoint) = tool.endpoint() else {
            return failure_outcome(tool_use_id, name, ToolError::validation(name, format!("'{name}' is registered as a programmatic tool but has no endpoint configured")));
        };

        let request = self.http_client.post(endpoint).json(&input).send();
        match tokio::time::timeout(self.timeout, request).await {
            Err(_) => failure_outcome(tool_use_id, name, ToolError::timeout(name)),
            Ok(Err(err)) => failure_outcome(tool_use_id, name, ToolError::new(name, ToolErrorKind::ExecutionError, err.to_string())),
            Ok(Ok(response)) => {
                let status = response.status();
                if status.as_u16() == 401 || status.as_u16() == 403 {
                    return failure_outcome(tool_use_id, name, ToolError::new(name, ToolErrorKind::AuthFailure, format!("endpoint returned {status}")));
                }
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return failure_outcome(tool_use_id, name, ToolError::new(name, ToolErrorKind::ExecutionError, format!("endpoint returned {status}: {body}")));
                }
                match response.json::<Value>().await {
                    Ok(value) => ToolExecutionOutcome { tool_use_id, tool_name: name.to_string(), result: value, is_error: false, error_kind: None },
                    Err(err) => failure_outcome(tool_use_id, name, ToolError::new(name, ToolErrorKind::ExecutionError, err.to_string())),
                }
            }
        }
    }
}

fn failure_outcome(tool_use_id: String, name: &str, err: ToolError) -> ToolExecutionOutcome {
    ToolExecutionOutcome {
        tool_use_id,
        tool_name: name.to_string(),
        result: serde_json::json!({ "error": err.message, "kind": err.kind }),
        is_error: true,
        error_kind: Some(err.kind),
    }
}
