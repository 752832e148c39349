//! Error types for the agent execution core.
//!
//! The taxonomy mirrors the four failure domains the core distinguishes
//! between: tool execution, provider/transport, session lifecycle, and the
//! client-facing wire protocol. Each nested type is matched explicitly by
//! its owning component — the RVR-B error classifier matches on
//! `(tool_name, ToolErrorKind)`, the router matches on [`ProviderError`],
//! the transport matches on [`ProtocolError`] — rather than by string
//! sniffing.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML configuration parse error.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A tool invocation failed.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// A provider adapter or router failure.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A session lifecycle failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A client transport protocol failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Invalid input supplied by a caller.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic catch-all for conditions that don't merit their own variant.
    #[error("error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a provider error from a free-form upstream error message,
    /// classifying 5xx status text as [`ProviderError::Upstream5xx`] and
    /// everything else as [`ProviderError::BadRequest`]. Prefer
    /// constructing the variant directly when the status is known.
    pub fn api(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        if ["500", "502", "503", "504"].iter().any(|code| msg.contains(code)) {
            Error::Provider(ProviderError::Upstream5xx(msg))
        } else {
            Error::Provider(ProviderError::BadRequest(msg))
        }
    }

    /// Create a provider stream-interrupted error.
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Provider(ProviderError::StreamInterrupted(msg.into()))
    }

    /// Create a tool execution error for an unnamed tool. Prefer
    /// [`ToolError::new`] when the tool name is known.
    pub fn tool(msg: impl Into<String>) -> Self {
        Error::Tool(ToolError::new("unknown", ToolErrorKind::ExecutionError, msg))
    }

    /// Create a new invalid input error.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Create a session timeout error.
    pub fn timeout() -> Self {
        Error::Session(SessionError::TimedOut)
    }
}

/// Errors surfaced by tool execution.
///
/// Every tool invocation is wrapped so exceptional outcomes land here
/// instead of propagating as unstructured panics or provider-shaped
/// errors; the RVR-B error classifier matches on `(tool_name, kind)` to
/// decide whether to continue, backtrack, fail gracefully, or escalate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?} executing tool '{tool_name}': {message}")]
pub struct ToolError {
    pub tool_name: String,
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(tool_name: impl Into<String>, kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(tool_name: impl Into<String>) -> Self {
        Self::new(tool_name, ToolErrorKind::Timeout, "tool call timed out")
    }

    pub fn not_found(tool_name: impl Into<String>) -> Self {
        let name = tool_name.into();
        Self::new(name.clone(), ToolErrorKind::NotFound, format!("tool '{name}' not found"))
    }

    pub fn validation(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(tool_name, ToolErrorKind::ValidationError, message)
    }

    /// The `(tool_name, kind)` pair used as the error classifier's
    /// equivalence key for "same error happened again".
    pub fn equivalence_key(&self) -> (String, ToolErrorKind) {
        (self.tool_name.clone(), self.kind)
    }
}

/// The tool error kinds the RVR-B executor classifies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    Timeout,
    AuthFailure,
    ValidationError,
    ExecutionError,
    NotFound,
}

/// Errors surfaced by a provider adapter or the router.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("rate limited: {0}")]
    RateLimit(String),
    #[error("upstream server error: {0}")]
    Upstream5xx(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    /// All configured router targets are in cooldown and probing failed.
    #[error("no provider target available: {0}")]
    NoTargetAvailable(String),
}

impl ProviderError {
    /// Whether the router should fail over to the next target rather than
    /// surface this as a terminal session error. Mid-stream, the router
    /// never fails over regardless of this value (see DESIGN.md).
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimit(_) | ProviderError::Upstream5xx(_) | ProviderError::StreamInterrupted(_)
        )
    }
}

/// Errors surfaced by the session orchestrator.
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("session was cancelled")]
    Cancelled,
    #[error("operation timed out")]
    TimedOut,
    #[error("session is in an invalid state for this operation: {0}")]
    StateInvalid(String),
    #[error("required capability is missing: {0}")]
    CapabilityMissing(String),
}

/// Errors surfaced by the client-facing transport protocol.
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error("a chat stream is already active on this connection")]
    RequestWhileActive,
}
