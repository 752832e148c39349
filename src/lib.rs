//! # Agent Execution Core
//!
//! A production execution core for local-first, multi-provider LLM agents:
//! capability-aware tool selection, a react/validate/reflect/backtrack
//! (RVR-B) control loop with a two-level circuit breaker, session
//! orchestration with human-in-the-loop rendezvous and snapshot/rollback,
//! a framed event transport, and a three-source memory fusion pipeline.
//!
//! ## Key Features
//!
//! - **Multi-Provider Routing**: Canonicalizes OpenAI-compatible and
//!   Anthropic-like wire formats to one event stream, with per-role
//!   failover and exponential cooldown.
//! - **Intent-Aware Tool Selection**: A four-layer intent cache (exact,
//!   near-duplicate, bounded model call, keyword fallback) scales tool
//!   exposure and termination thresholds to a turn's complexity.
//! - **RVR-B Control Loop**: Tabular error classification, context
//!   cleaning on backtrack, and adaptive termination bound the loop
//!   without ever surfacing a raw tool-error string to the model.
//! - **Session Orchestration**: Validated state machine transitions,
//!   cooperative cancellation, HITL escalation, and snapshot/rollback.
//! - **Framed Transport**: Monotonic sequence numbers, throttled
//!   content-delta emission, bounded-channel backpressure.
//! - **Memory Fusion**: Markdown, keyword-FTS, and semantic recall
//!   blended and deduplicated; playbooks with a draft/approve lifecycle.
//!
//! ## Architecture
//!
//! - **capability**: Two-layer (static + per-agent) capability registry (C1).
//! - **provider**: Canonical provider adapter trait, OpenAI-compatible and
//!   Anthropic-like implementations, and the failover router (C2).
//! - **context**: Context pipeline injectors, scratchpad compression, and
//!   history decay (C3).
//! - **intent**: Four-layer cached intent analyzer (C4).
//! - **selector**: Three-layer tool selection and typed tool execution (C5).
//! - **executor**: The RVR-B control loop (C6).
//! - **session**: Session state machine, cancellation, and HITL rendezvous (C7).
//! - **transport**: Framed client-facing event protocol (C8).
//! - **memory**: Memory fusion and playbook injectors (C9).
//! - **store**: Boundary collaborator traits for conversation/vector/markdown
//!   storage and skill discovery, with in-memory reference implementations.
//! - **client**: The teacher SDK's single-session streaming query engine,
//!   kept for direct one-shot/multi-turn use outside the RVR-B loop.
//! - **types**: Data structures for messages, content blocks, capabilities,
//!   intent results, and session state.
//! - **tools**: Tool definition system with automatic JSON schema generation.
//! - **hooks**: Lifecycle event system for intercepting execution.
//! - **config**: Provider profile resolution and runtime configuration.
//! - **error**: Comprehensive error taxonomy and conversions.
//! - **retry**: Exponential backoff retry logic with jitter.
//! - **utils**: Internal utilities for SSE parsing and tool aggregation.

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================
// These modules are private (internal implementation details) unless explicitly
// re-exported through `pub use` statements below.

/// Two-layer capability registry: a static, process-wide layer overlaid by
/// per-agent capabilities, both feeding the tool selector.
mod capability;

/// Core client implementation providing streaming queries and stateful
/// conversations outside the RVR-B loop.
mod client;

/// Provider configuration helpers and the runtime configuration surface
/// (provider profiles, execution thresholds, skill groups, memory fusion
/// weights).
mod config;

/// Context pipeline: injector ordering, token-budgeted assembly,
/// scratchpad compression, and progressive history decay.
mod context;

/// Error types and conversions for comprehensive error handling throughout the SDK.
/// Defines the `Error` enum and `Result<T>` type alias used across all public APIs.
mod error;

/// The RVR-B control loop: error classification, circuit breaking,
/// context cleaning on backtrack, and adaptive termination.
mod executor;

/// Lifecycle hooks system for intercepting and controlling execution at key points.
/// Enables security gates, audit logging, input/output modification, and compliance checks.
mod hooks;

/// Four-layer cached intent analyzer feeding tool selection and executor
/// thresholds.
mod intent;

/// Memory fusion and playbook context injectors.
mod memory;

/// Canonical provider adapter trait and router, normalizing OpenAI-compatible
/// and Anthropic-like wire formats to one event stream with per-role failover.
mod provider;

/// Three-layer tool selection and typed, timeout-wrapped tool execution.
mod selector;

/// Session state machine, cancellation signal, HITL rendezvous, and
/// snapshot/rollback.
mod session;

/// Boundary collaborator traits (conversation/vector/markdown storage,
/// skill discovery) with in-memory reference implementations.
mod store;

/// Tool definition and execution system with automatic JSON schema generation.
/// Allows LLMs to call Rust functions with type-safe parameter handling.
mod tools;

/// Framed client-facing event transport: sequencing, throttled content
/// deltas, and bounded-channel backpressure.
mod transport;

/// Core type definitions for messages, content blocks, and agent configuration.
/// Includes builder patterns for ergonomic configuration and OpenAI API serialization.
mod types;

/// Internal utilities for Server-Sent Events (SSE) parsing and tool call aggregation.
/// Handles the low-level details of streaming response parsing.
mod utils;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================
// These items form the public API of the SDK. Everything else is internal.

/// Retry utilities with exponential backoff and jitter.
/// Made public as a module so users can access retry configuration and functions
/// for their own operations that need retry logic.
pub mod retry;

// --- Core Client API ---

pub use client::{query, Client};

// --- Capability Registry ---

pub use capability::{CapabilityRegistry, SharedCapabilityRegistry};

// --- Provider Configuration & Runtime Config ---

pub use config::{get_base_url, get_model, Provider, RuntimeConfig};

// --- Provider Adapters & Router ---

pub use provider::{
    AnthropicLikeAdapter, ContentBlockKind, ContentDelta, OpenAiCompatibleAdapter, ProviderAdapter, ProviderRequest, ProviderRouter, RouterTarget,
    StreamEvent,
};

// --- Context Management ---

pub use context::{
    cache_stable_serialize, compress_tool_result, decay_history, estimate_tokens, is_approaching_limit, restate_goal, truncate_messages, CacheClass,
    ContextInjector, ContextPipeline, GoalRestatement, InMemoryScratchpad, InjectorPhase, ScratchpadStore,
};

// --- Intent Analysis ---

pub use intent::IntentAnalyzer;

// --- Tool Selection & Execution ---

pub use selector::{ExecutionStrategy, ToolExecutionOutcome, ToolExecutor, ToolSelector};

// --- RVR-B Executor ---

pub use executor::{CancelSignal, CircuitBreaker, ErrorClassifier, ErrorDecision, ExecutorThresholds, RvrbExecutor, SessionRunOutcome, TerminationReason};

// --- Session Orchestration ---

pub use session::{needs_further_turns, HitlRequest, HitlResponse, Session, SessionRegistry, SharedSessionRegistry};

// --- Transport ---

pub use transport::{parse_request, Connection, ConnectionHandle, Event, Frame, Request, Response};

// --- Memory & Playbooks ---

pub use memory::{MemoryFusion, Playbook, PlaybookStatus, PlaybookStore};

// --- Storage Boundary Traits ---

pub use store::{
    ConversationStore, InMemoryConversationStore, InMemoryMarkdownStore, InMemoryVectorStore, MarkdownMemoryStore, RetrievedMemory, SharedConversationStore,
    SharedMarkdownStore, SharedSkillDiscovery, SharedVectorStore, SkillDiscovery, StaticSkillDiscovery, VectorStore,
};

// --- Error Handling ---

pub use error::{Error, ProtocolError, ProviderError, Result, SessionError, ToolError, ToolErrorKind};

// --- Lifecycle Hooks ---

pub use hooks::{
    HookDecision, Hooks, PostToolUseEvent, PreToolUseEvent, UserPromptSubmitEvent, HOOK_POST_TOOL_USE, HOOK_PRE_TOOL_USE, HOOK_USER_PROMPT_SUBMIT,
};

// --- Tool System ---

pub use tools::{tool, Tool, ToolBuilder};

// --- Core Types ---

pub use types::{
    AgentOptions, AgentOptionsBuilder, Capability, CapabilityStatus, Complexity, ContentBlock, Conversation, ConversationId, IntentResult, IntentSource,
    Message, MessageRole, Plan, PlanStep, SessionId, SessionState, Snapshot, TextBlock, ToolInvocationRecord, ToolResultBlock, ToolUseBlock,
};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// Convenience module containing the most commonly used types and functions.
/// Import with `use agent_exec_core::prelude::*;` to get everything you need for typical usage.
///
/// This includes:
/// - Configuration: AgentOptions, AgentOptionsBuilder, RuntimeConfig
/// - Client: Client, query()
/// - Content: ContentBlock, TextBlock, ToolUseBlock
/// - Tools: Tool, tool()
/// - The RVR-B loop: RvrbExecutor, Session, ToolSelector
/// - Hooks: Hooks, HookDecision, hook event types
/// - Errors: Error, Result
pub mod prelude {
    pub use crate::{
        query, tool, AgentOptions, AgentOptionsBuilder, Client, ContentBlock, Error, HookDecision, Hooks, IntentAnalyzer, PostToolUseEvent,
        PreToolUseEvent, Result, RuntimeConfig, RvrbExecutor, Session, TextBlock, Tool, ToolSelector, ToolUseBlock, UserPromptSubmitEvent,
    };
}
