//! # stepwise-runtime — the agent loop
//!
//! [`AgentLoop`] turns a prompt into a sequence of model calls and tool
//! executions recorded in a session log, ending in exactly one `Result`
//! event per query (unless cancelled).
//!
//! ```text
//! Init → ModelCall → (ToolExecution)* → [Compaction] → ModelCall → … → Result
//! ```
//!
//! Suspension points that observe the cancellation token: the provider call
//! (including rate-limit backoff), each tool invocation (a [`SubAgentTool`]
//! passes cancellation on to its nested query), and a permission question
//! waiting on its answerer. Appends to the log are never interrupted.

mod agent;
mod config;
mod subagent;

pub use agent::{AgentLoop, AgentLoopBuilder, QueryError, QueryOutcome, QueryRequest};
pub use config::{RetryPolicy, RuntimeConfig};
pub use subagent::SubAgentTool;
