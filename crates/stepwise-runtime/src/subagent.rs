use async_trait::async_trait;
use serde_json::{Value, json};
use stepwise_protocol::{StopReason, Tool, ToolContext, ToolError, ToolSchema};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::agent::{AgentLoop, QueryRequest};

/// Runs `{prompt}` as a nested query in a fresh session and returns its
/// final text.
///
/// The nested query runs on its own task. When the calling tool future is
/// dropped (the outer query was cancelled) the nested query's token fires,
/// so it stops at one of its own cancellation points rather than mid-append.
#[derive(Clone)]
pub struct SubAgentTool {
    name: String,
    description: String,
    agent: AgentLoop,
}

impl SubAgentTool {
    pub fn new(name: impl Into<String>, description: impl Into<String>, agent: AgentLoop) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            agent,
        }
    }
}

impl std::fmt::Debug for SubAgentTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubAgentTool")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Tool for SubAgentTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: json!({
                "type": "object",
                "properties": {"prompt": {"type": "string"}},
                "required": ["prompt"],
            }),
        }
    }

    #[instrument(skip_all, fields(tool = %self.name))]
    async fn run(&self, input: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let prompt = input
            .get("prompt")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::invalid_input(format!("{} requires input.prompt", self.name)))?
            .to_owned();

        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();
        let agent = self.agent.clone();
        let joined = tokio::spawn(async move { agent.run(QueryRequest::new(prompt), cancel).await })
            .await;
        guard.disarm();

        let outcome = match joined {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => return Err(ToolError::execution(format!("sub-agent failed: {err}"))),
            Err(err) => return Err(ToolError::execution(format!("sub-agent task failed: {err}"))),
        };
        info!(
            session_id = %outcome.session_id,
            stop_reason = outcome.stop_reason.as_str(),
            steps = outcome.steps,
            "sub-agent finished"
        );
        if outcome.stop_reason != StopReason::End {
            return Err(ToolError::execution(format!(
                "sub-agent stopped with {}: {}",
                outcome.stop_reason.as_str(),
                outcome.final_text
            )));
        }
        Ok(json!({
            "session_id": outcome.session_id.to_string(),
            "text": outcome.final_text,
            "steps": outcome.steps,
        }))
    }
}
