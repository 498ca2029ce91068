use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stepwise_protocol::{PermissionDecision, PermissionGate, PermissionRequest, QuestionAnswerer};
use tracing::debug;

use crate::matches;

/// Fallback applied when no rule names the tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    #[default]
    Allow,
    Ask,
    Deny,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Ask => "ask",
            Self::Deny => "deny",
        }
    }
}

/// Tool-name patterns per outcome. Same pattern syntax as hook matchers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionRules {
    pub mode: PermissionMode,
    pub allow: Vec<String>,
    pub ask: Vec<String>,
    pub deny: Vec<String>,
}

/// Evaluates deny rules, then ask rules, then allow rules, then the mode.
#[derive(Debug, Clone, Default)]
pub struct RulePermissionGate {
    rules: PermissionRules,
}

impl RulePermissionGate {
    pub fn new(rules: PermissionRules) -> Self {
        Self { rules }
    }

    pub fn with_mode(mode: PermissionMode) -> Self {
        Self::new(PermissionRules {
            mode,
            ..PermissionRules::default()
        })
    }

    pub fn rules(&self) -> &PermissionRules {
        &self.rules
    }

    fn first_match<'a>(patterns: &'a [String], tool: &str) -> Option<&'a str> {
        patterns
            .iter()
            .map(String::as_str)
            .find(|pattern| matches(pattern, tool))
    }

    fn question(request: &PermissionRequest) -> String {
        format!(
            "Allow tool `{}` with input {}? [y/N]",
            request.tool_name, request.input
        )
    }

    pub fn evaluate(&self, request: &PermissionRequest) -> PermissionDecision {
        let tool = request.tool_name.as_str();
        if let Some(rule) = Self::first_match(&self.rules.deny, tool) {
            return PermissionDecision::deny(format!("tool `{tool}` denied by rule `{rule}`"));
        }
        if Self::first_match(&self.rules.ask, tool).is_some() {
            return PermissionDecision::ask(Self::question(request));
        }
        if Self::first_match(&self.rules.allow, tool).is_some() {
            return PermissionDecision::allow();
        }
        match self.rules.mode {
            PermissionMode::Allow => PermissionDecision::allow(),
            PermissionMode::Ask => PermissionDecision::ask(Self::question(request)),
            PermissionMode::Deny => PermissionDecision::deny(format!(
                "tool `{tool}` denied by permission mode `{}`",
                self.rules.mode.as_str()
            )),
        }
    }
}

#[async_trait]
impl PermissionGate for RulePermissionGate {
    async fn approve(&self, request: &PermissionRequest) -> PermissionDecision {
        let decision = self.evaluate(request);
        debug!(
            tool = %request.tool_name,
            allowed = decision.allowed,
            asked = decision.question.is_some(),
            "permission evaluated"
        );
        decision
    }
}

/// Answers every question with the same reply. Useful for unattended runs
/// and tests.
#[derive(Debug, Clone)]
pub struct StaticAnswerer {
    answer: Option<String>,
}

impl StaticAnswerer {
    pub fn new(answer: impl Into<String>) -> Self {
        Self {
            answer: Some(answer.into()),
        }
    }

    pub fn silent() -> Self {
        Self { answer: None }
    }
}

#[async_trait]
impl QuestionAnswerer for StaticAnswerer {
    fn name(&self) -> &str {
        "static"
    }

    async fn ask(&self, _tool_use_id: &str, _question: &str) -> Option<String> {
        self.answer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_protocol::SessionId;

    fn request(tool: &str) -> PermissionRequest {
        PermissionRequest {
            session_id: SessionId::default(),
            tool_use_id: "call_1".into(),
            tool_name: tool.into(),
            input: json!({"cmd": "ls"}),
            cwd: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn rules_route_deny_ask_allow_then_mode() {
        let gate = RulePermissionGate::new(PermissionRules {
            mode: PermissionMode::Deny,
            allow: vec!["read_*".into(), "bash".into()],
            ask: vec!["write_*".into()],
            deny: vec!["bash".into()],
        });

        let denied = gate.approve(&request("bash")).await;
        assert!(!denied.allowed);
        assert_eq!(
            denied.deny_message.as_deref(),
            Some("tool `bash` denied by rule `bash`")
        );

        let asked = gate.approve(&request("write_file")).await;
        assert!(!asked.allowed);
        assert!(asked.question.is_some_and(|q| q.contains("write_file")));

        assert!(gate.approve(&request("read_file")).await.allowed);

        let fallback = gate.approve(&request("net_fetch")).await;
        assert_eq!(
            fallback.deny_message.as_deref(),
            Some("tool `net_fetch` denied by permission mode `deny`")
        );
    }

    #[tokio::test]
    async fn default_gate_allows_everything() {
        let gate = RulePermissionGate::default();
        assert!(gate.approve(&request("anything")).await.allowed);
    }

    #[test]
    fn rules_deserialize_with_defaults() {
        let rules: PermissionRules =
            serde_json::from_value(json!({"mode": "ask", "deny": ["rm*"]})).unwrap();
        assert_eq!(rules.mode, PermissionMode::Ask);
        assert!(rules.allow.is_empty());
        assert_eq!(rules.deny, vec!["rm*".to_owned()]);
    }

    #[tokio::test]
    async fn static_answerer_replies() {
        assert_eq!(
            StaticAnswerer::new("yes").ask("call_1", "ok?").await.as_deref(),
            Some("yes")
        );
        assert_eq!(StaticAnswerer::silent().ask("call_1", "ok?").await, None);
    }
}
