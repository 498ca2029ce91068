//! Hook points, payloads, and decisions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{ModelOutput, ModelRequest};

/// Where in the loop a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    UserPromptSubmit,
    BeforeModelCall,
    AfterModelCall,
    PreToolUse,
    PostToolUse,
    SessionCompacting,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserPromptSubmit => "user_prompt_submit",
            Self::BeforeModelCall => "before_model_call",
            Self::AfterModelCall => "after_model_call",
            Self::PreToolUse => "pre_tool_use",
            Self::PostToolUse => "post_tool_use",
            Self::SessionCompacting => "session_compacting",
        }
    }
}

/// Point-specific data handed to a hook. A `Rewrite` decision must return a
/// payload of the same variant; mismatched rewrites are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "point", rename_all = "snake_case")]
pub enum HookPayload {
    UserPromptSubmit {
        prompt: String,
    },
    BeforeModelCall {
        request: ModelRequest,
    },
    AfterModelCall {
        output: ModelOutput,
    },
    PreToolUse {
        tool_use_id: String,
        tool_name: String,
        input: Value,
    },
    PostToolUse {
        tool_use_id: String,
        tool_name: String,
        output: Value,
        is_error: bool,
    },
    SessionCompacting {
        instruction: String,
    },
}

impl HookPayload {
    pub fn point(&self) -> HookPoint {
        match self {
            Self::UserPromptSubmit { .. } => HookPoint::UserPromptSubmit,
            Self::BeforeModelCall { .. } => HookPoint::BeforeModelCall,
            Self::AfterModelCall { .. } => HookPoint::AfterModelCall,
            Self::PreToolUse { .. } => HookPoint::PreToolUse,
            Self::PostToolUse { .. } => HookPoint::PostToolUse,
            Self::SessionCompacting { .. } => HookPoint::SessionCompacting,
        }
    }

    /// Name that registration matchers are tested against: the tool name
    /// for tool points, the model id for model-call points.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::PreToolUse { tool_name, .. } | Self::PostToolUse { tool_name, .. } => {
                Some(tool_name)
            }
            Self::BeforeModelCall { request } => Some(&request.model),
            _ => None,
        }
    }
}

/// What a hook wants the loop to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum HookDecision {
    Continue,
    Rewrite(HookPayload),
    Block { reason: String },
}

impl HookDecision {
    pub fn block(reason: impl Into<String>) -> Self {
        Self::Block {
            reason: reason.into(),
        }
    }

    /// Short label recorded in `HookEvent.decision`.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Rewrite(_) => "rewrite",
            Self::Block { .. } => "block",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_reports_point_and_target() {
        let payload = HookPayload::PreToolUse {
            tool_use_id: "t1".into(),
            tool_name: "read_file".into(),
            input: json!({}),
        };
        assert_eq!(payload.point(), HookPoint::PreToolUse);
        assert_eq!(payload.target(), Some("read_file"));

        let prompt = HookPayload::UserPromptSubmit {
            prompt: "hi".into(),
        };
        assert_eq!(prompt.target(), None);
    }

    #[test]
    fn hook_point_serializes_snake_case() {
        let json = serde_json::to_string(&HookPoint::SessionCompacting).unwrap();
        assert_eq!(json, "\"session_compacting\"");
        assert_eq!(HookPoint::SessionCompacting.as_str(), "session_compacting");
    }

    #[test]
    fn decision_labels() {
        assert_eq!(HookDecision::Continue.label(), "continue");
        assert_eq!(HookDecision::block("no").label(), "block");
    }
}
