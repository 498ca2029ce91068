//! Error taxonomy shared by providers, tools, and hooks.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures surfaced by a model provider adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("provider request timed out")]
    Timeout,
    #[error("provider rate limited the request{}", retry_after_suffix(.retry_after))]
    RateLimit { retry_after: Option<Duration> },
    #[error("provider returned http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("provider returned an invalid response: {raw}")]
    InvalidResponse { raw: String },
    #[error("provider transport failed: {message}")]
    Transport { message: String },
    #[error("provider stream failed: {message}")]
    Stream { message: String },
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(delay) => format!(" (retry after {}ms)", delay.as_millis()),
        None => String::new(),
    }
}

impl ProviderError {
    /// Stable machine-readable name, written to `RuntimeError.error_kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimit { .. } => "rate_limit",
            Self::Http { .. } => "http",
            Self::InvalidResponse { .. } => "invalid_response",
            Self::Transport { .. } => "transport",
            Self::Stream { .. } => "stream",
        }
    }

    /// Heuristic: the provider refused a `previous_response_id` it no longer
    /// recognises.
    pub fn rejects_reply_threading(&self) -> bool {
        let text = match self {
            Self::Http { status, body } if (400..500).contains(status) && *status != 429 => body,
            Self::InvalidResponse { raw } => raw,
            _ => return false,
        };
        let text = text.to_ascii_lowercase();
        text.contains("previous_response_id")
            || text.contains("previous response")
            || (text.contains("response") && text.contains("not found"))
    }

    pub fn invalid_response(raw: impl Into<String>) -> Self {
        Self::InvalidResponse { raw: raw.into() }
    }

    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream {
            message: message.into(),
        }
    }
}

/// Structured reasons a tool call did not produce a successful result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// The tool ran and reported a failure (or panicked).
    Execution,
    /// The tool rejected its input.
    InvalidInput,
    /// No tool with the requested name is registered.
    UnknownTool,
    /// The tool is registered but not on the allow-list for this query.
    ToolNotAllowed,
    /// The permission gate denied the call.
    PermissionDenied,
    /// A `pre_tool_use` or `post_tool_use` hook blocked the call.
    HookBlocked,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::InvalidInput => "invalid_input",
            Self::UnknownTool => "unknown_tool",
            Self::ToolNotAllowed => "tool_not_allowed",
            Self::PermissionDenied => "permission_denied",
            Self::HookBlocked => "hook_blocked",
        }
    }
}

/// A failed tool call. Never escalates past the loop; it is logged as an
/// error `ToolResult`.
#[derive(Debug, Clone, Error)]
#[error("{}: {message}", .kind.as_str())]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Execution, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::InvalidInput, message)
    }
}

/// A hook invocation that failed. The pipeline records it and moves on.
#[derive(Debug, Clone, Error)]
#[error("hook failed: {0}")]
pub struct HookError(pub String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
