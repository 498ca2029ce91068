//! Event taxonomy for session logs.
//!
//! One [`EventRecord`] is one line of a session log: a JSON object carrying
//! `type`, `seq`, `ts`, and the variant fields of its [`EventKind`].
//!
//! Forward-compatible: unknown `"type"` tags deserialize into
//! [`EventKind::Unknown`], which keeps the original object verbatim and writes
//! it back unchanged. A *known* tag whose fields do not fit is an error, since
//! that indicates a damaged line rather than a newer writer.
//!
//! Streaming text never appears here. Live deltas travel as
//! [`AgentEvent::AssistantDelta`], which the store API cannot accept.

use serde::de::Error as _;
use serde::ser::{Error as _, SerializeMap};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::ToolErrorKind;
use crate::hook::HookPoint;
use crate::ids::{SeqNo, SessionId};
use crate::model::Usage;

/// Tags of every variant this version knows how to read.
pub const KNOWN_EVENT_TYPES: &[&str] = &[
    "system_init",
    "user_message",
    "assistant_message",
    "tool_use",
    "tool_result",
    "tool_output_compacted",
    "user_compaction",
    "user_question",
    "user_answer",
    "hook_event",
    "runtime_error",
    "result",
];

/// Current time as fractional seconds since the UNIX epoch.
pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// A stored, sequence-numbered event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub seq: SeqNo,
    pub ts: f64,
    pub kind: EventKind,
}

impl EventRecord {
    /// Create a record stamped with the current time.
    pub fn new(seq: SeqNo, kind: EventKind) -> Self {
        Self {
            seq,
            ts: now_ts(),
            kind,
        }
    }

    pub fn type_name(&self) -> &str {
        self.kind.type_name()
    }
}

impl Serialize for EventRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let fields = self.kind.to_fields().map_err(S::Error::custom)?;
        let mut map = serializer.serialize_map(Some(fields.len() + 2))?;
        map.serialize_entry("type", self.kind.type_name())?;
        map.serialize_entry("seq", &self.seq)?;
        map.serialize_entry("ts", &self.ts)?;
        for (key, value) in &fields {
            if matches!(key.as_str(), "type" | "seq" | "ts") {
                continue;
            }
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for EventRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        let Value::Object(mut object) = raw else {
            return Err(D::Error::custom("event line is not a JSON object"));
        };
        let seq = object
            .remove("seq")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| D::Error::custom("event is missing an integer `seq`"))?;
        let ts = object
            .remove("ts")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| D::Error::custom("event is missing a numeric `ts`"))?;
        let kind = EventKind::from_value(Value::Object(object)).map_err(D::Error::custom)?;
        Ok(Self { seq, ts, kind })
    }
}

/// Which part of the loop an escalated failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPhase {
    Provider,
    Session,
}

/// Why a query ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    End,
    MaxSteps,
    HookBlocked,
    Error,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::End => "end",
            Self::MaxSteps => "max_steps",
            Self::HookBlocked => "hook_blocked",
            Self::Error => "error",
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Every persisted event variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// First event of a new session.
    SystemInit {
        session_id: SessionId,
        cwd: String,
        runtime_version: String,
    },
    UserMessage {
        text: String,
        /// Set on turns the loop writes itself (the post-compaction "continue").
        #[serde(skip_serializing_if = "is_false")]
        synthetic: bool,
    },
    AssistantMessage {
        text: String,
        #[serde(skip_serializing_if = "is_false")]
        is_summary: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },
    ToolUse {
        tool_use_id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        output: Value,
        #[serde(skip_serializing_if = "is_false")]
        is_error: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_kind: Option<ToolErrorKind>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    /// The output of `tool_use_id` is pruned from future provider context.
    ToolOutputCompacted {
        tool_use_id: String,
    },
    /// An overflow-triggered compaction turn.
    UserCompaction {
        auto: bool,
        usage_tokens: u64,
    },
    UserQuestion {
        tool_use_id: String,
        question: String,
    },
    UserAnswer {
        tool_use_id: String,
        answer: Option<String>,
    },
    HookEvent {
        hook: String,
        point: HookPoint,
        matched: bool,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        decision: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    RuntimeError {
        phase: ErrorPhase,
        error_kind: String,
        message: String,
    },
    /// Terminal event of a query.
    Result {
        final_text: String,
        session_id: SessionId,
        stop_reason: StopReason,
        steps: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
        #[serde(skip_serializing_if = "is_false")]
        threading_disabled: bool,
    },
    /// A line written by a newer (or foreign) writer.
    #[serde(skip_serializing)]
    Unknown { event_type: String, raw: Value },
}

impl EventKind {
    pub fn type_name(&self) -> &str {
        match self {
            Self::SystemInit { .. } => "system_init",
            Self::UserMessage { .. } => "user_message",
            Self::AssistantMessage { .. } => "assistant_message",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::ToolOutputCompacted { .. } => "tool_output_compacted",
            Self::UserCompaction { .. } => "user_compaction",
            Self::UserQuestion { .. } => "user_question",
            Self::UserAnswer { .. } => "user_answer",
            Self::HookEvent { .. } => "hook_event",
            Self::RuntimeError { .. } => "runtime_error",
            Self::Result { .. } => "result",
            Self::Unknown { event_type, .. } => event_type,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result { .. })
    }

    /// Render as a JSON object including the `type` tag.
    pub fn to_fields(&self) -> Result<Map<String, Value>, serde_json::Error> {
        let value = match self {
            Self::Unknown { raw, .. } => raw.clone(),
            known => serde_json::to_value(known)?,
        };
        match value {
            Value::Object(map) => Ok(map),
            other => Err(<serde_json::Error as serde::de::Error>::custom(format!(
                "event payload is not an object: {other}"
            ))),
        }
    }

    /// Parse a tagged JSON object, keeping unknown tags verbatim.
    pub fn from_value(raw: Value) -> Result<Self, serde_json::Error> {
        let event_type = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                <serde_json::Error as serde::de::Error>::custom("event is missing a string `type`")
            })?
            .to_owned();
        if !KNOWN_EVENT_TYPES.contains(&event_type.as_str()) {
            return Ok(Self::Unknown { event_type, raw });
        }
        serde_json::from_value::<EventKindKnown>(raw).map(Into::into)
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Self::from_value(raw).map_err(D::Error::custom)
    }
}

/// Deserialization mirror of the known variants.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EventKindKnown {
    SystemInit {
        session_id: SessionId,
        cwd: String,
        runtime_version: String,
    },
    UserMessage {
        text: String,
        #[serde(default)]
        synthetic: bool,
    },
    AssistantMessage {
        text: String,
        #[serde(default)]
        is_summary: bool,
        #[serde(default)]
        response_id: Option<String>,
    },
    ToolUse {
        tool_use_id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        output: Value,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        error_kind: Option<ToolErrorKind>,
        #[serde(default)]
        error_message: Option<String>,
    },
    ToolOutputCompacted {
        tool_use_id: String,
    },
    UserCompaction {
        auto: bool,
        #[serde(default)]
        usage_tokens: u64,
    },
    UserQuestion {
        tool_use_id: String,
        question: String,
    },
    UserAnswer {
        tool_use_id: String,
        #[serde(default)]
        answer: Option<String>,
    },
    HookEvent {
        hook: String,
        point: HookPoint,
        matched: bool,
        duration_ms: u64,
        #[serde(default)]
        decision: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    RuntimeError {
        phase: ErrorPhase,
        error_kind: String,
        message: String,
    },
    Result {
        final_text: String,
        session_id: SessionId,
        stop_reason: StopReason,
        steps: u32,
        #[serde(default)]
        usage: Option<Usage>,
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        threading_disabled: bool,
    },
}

impl From<EventKindKnown> for EventKind {
    fn from(k: EventKindKnown) -> Self {
        match k {
            EventKindKnown::SystemInit {
                session_id,
                cwd,
                runtime_version,
            } => Self::SystemInit {
                session_id,
                cwd,
                runtime_version,
            },
            EventKindKnown::UserMessage { text, synthetic } => Self::UserMessage { text, synthetic },
            EventKindKnown::AssistantMessage {
                text,
                is_summary,
                response_id,
            } => Self::AssistantMessage {
                text,
                is_summary,
                response_id,
            },
            EventKindKnown::ToolUse {
                tool_use_id,
                name,
                input,
            } => Self::ToolUse {
                tool_use_id,
                name,
                input,
            },
            EventKindKnown::ToolResult {
                tool_use_id,
                output,
                is_error,
                error_kind,
                error_message,
            } => Self::ToolResult {
                tool_use_id,
                output,
                is_error,
                error_kind,
                error_message,
            },
            EventKindKnown::ToolOutputCompacted { tool_use_id } => {
                Self::ToolOutputCompacted { tool_use_id }
            }
            EventKindKnown::UserCompaction { auto, usage_tokens } => {
                Self::UserCompaction { auto, usage_tokens }
            }
            EventKindKnown::UserQuestion {
                tool_use_id,
                question,
            } => Self::UserQuestion {
                tool_use_id,
                question,
            },
            EventKindKnown::UserAnswer {
                tool_use_id,
                answer,
            } => Self::UserAnswer {
                tool_use_id,
                answer,
            },
            EventKindKnown::HookEvent {
                hook,
                point,
                matched,
                duration_ms,
                decision,
                error,
            } => Self::HookEvent {
                hook,
                point,
                matched,
                duration_ms,
                decision,
                error,
            },
            EventKindKnown::RuntimeError {
                phase,
                error_kind,
                message,
            } => Self::RuntimeError {
                phase,
                error_kind,
                message,
            },
            EventKindKnown::Result {
                final_text,
                session_id,
                stop_reason,
                steps,
                usage,
                response_id,
                threading_disabled,
            } => Self::Result {
                final_text,
                session_id,
                stop_reason,
                steps,
                usage,
                response_id,
                threading_disabled,
            },
        }
    }
}

/// What live subscribers observe while a query runs.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Incremental assistant text from a streaming provider. Never stored.
    AssistantDelta { text: String },
    /// An event that has been durably appended.
    Persisted(EventRecord),
}
