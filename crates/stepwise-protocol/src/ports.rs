//! Collaborator ports consumed by the runtime loop.
//!
//! Traits use `async-trait` for dyn dispatch; every collaborator is held as
//! `Arc<dyn ...>` by the loop.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HookError, ProviderError, ToolError};
use crate::hook::{HookDecision, HookPayload};
use crate::ids::SessionId;
use crate::model::{
    ModelOutput, ModelRequest, ModelStream, ProviderCapabilities, StreamEvent, ToolSchema,
};

/// A language-model backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::default()
    }

    async fn complete(&self, request: ModelRequest) -> Result<ModelOutput, ProviderError>;

    /// Errors returned here happen before any output; failures after the
    /// stream starts arrive as `StreamEvent::Failed` or `StreamEvent::Aborted`.
    async fn stream(&self, request: ModelRequest) -> Result<ModelStream, ProviderError> {
        let output = self.complete(request).await?;
        Ok(Box::pin(futures_util::stream::once(async move {
            StreamEvent::Completed(output)
        })))
    }
}

/// Filesystem context passed to every tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub fs_root: PathBuf,
    pub cwd: PathBuf,
    pub project_dir: PathBuf,
}

impl ToolContext {
    pub fn new(session_id: SessionId, cwd: impl Into<PathBuf>) -> Self {
        let cwd = cwd.into();
        Self {
            session_id,
            fs_root: cwd.clone(),
            project_dir: cwd.clone(),
            cwd,
        }
    }
}

/// An external capability the model can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn schema(&self) -> ToolSchema;

    async fn run(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

/// A single hook callback. Matching and isolation live in the pipeline.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn invoke(&self, payload: &HookPayload) -> Result<HookDecision, HookError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub session_id: SessionId,
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: Value,
    pub cwd: PathBuf,
}

/// Outcome of a permission check. A `question` defers the decision to the
/// configured answerer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
}

impl PermissionDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            ..Self::default()
        }
    }

    pub fn allow_with_input(input: Value) -> Self {
        Self {
            allowed: true,
            updated_input: Some(input),
            ..Self::default()
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            deny_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn ask(question: impl Into<String>) -> Self {
        Self {
            allowed: false,
            question: Some(question.into()),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn approve(&self, request: &PermissionRequest) -> PermissionDecision;
}

/// Answers permission questions, typically by prompting a human.
#[async_trait]
pub trait QuestionAnswerer: Send + Sync {
    fn name(&self) -> &str;

    /// `None` means no answer could be obtained.
    async fn ask(&self, tool_use_id: &str, question: &str) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;

    struct Fixed;

    #[async_trait]
    impl ModelProvider for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn complete(&self, _request: ModelRequest) -> Result<ModelOutput, ProviderError> {
            Ok(ModelOutput::text("done"))
        }
    }

    #[tokio::test]
    async fn default_stream_wraps_complete() {
        let mut stream = Fixed
            .stream(ModelRequest::new("m", Vec::new()))
            .await
            .unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(first, StreamEvent::Completed(ModelOutput::text("done")));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn permission_constructors() {
        assert!(PermissionDecision::allow().allowed);
        let rewritten = PermissionDecision::allow_with_input(json!({"path": "a"}));
        assert_eq!(rewritten.updated_input, Some(json!({"path": "a"})));
        let denied = PermissionDecision::deny("mode is deny");
        assert!(!denied.allowed);
        assert_eq!(denied.deny_message.as_deref(), Some("mode is deny"));
        assert!(PermissionDecision::ask("ok?").question.is_some());
    }
}
