//! # stepwise-protocol — shared contract types
//!
//! Types and collaborator ports that every stepwise crate depends on. No
//! runtime dependencies (tokio, reqwest) so it can be used as a pure
//! contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`] — Typed ID wrapper (SessionId) and `SeqNo`
//! - [`event`] — EventRecord + EventKind (forward-compatible), AgentEvent
//! - [`model`] — ModelRequest, ModelOutput, StreamEvent, Usage, WireProtocol
//! - [`hook`] — HookPoint, HookPayload, HookDecision
//! - [`ports`] — ModelProvider, Tool, Hook, PermissionGate, QuestionAnswerer
//! - [`error`] — ProviderError, ToolError, HookError

pub mod error;
pub mod event;
pub mod hook;
pub mod ids;
pub mod model;
pub mod ports;

pub use error::{HookError, ProviderError, ToolError, ToolErrorKind};
pub use event::{AgentEvent, ErrorPhase, EventKind, EventRecord, StopReason, now_ts};
pub use hook::{HookDecision, HookPayload, HookPoint};
pub use ids::{SeqNo, SessionId};
pub use model::{
    InputItem, ModelOutput, ModelRequest, ModelStream, ProviderCapabilities, Role, StreamEvent,
    ToolCall, ToolSchema, Usage, WireProtocol,
};
pub use ports::{
    Hook, ModelProvider, PermissionDecision, PermissionGate, PermissionRequest, QuestionAnswerer,
    Tool, ToolContext,
};

/// Version written into `SystemInit.runtime_version`.
pub const RUNTIME_VERSION: &str = env!("CARGO_PKG_VERSION");
