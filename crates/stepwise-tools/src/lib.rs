//! Tool registry and dispatch.
//!
//! The registry keeps tools in registration order so the schema list sent to
//! providers is stable. [`ToolDispatcher`] adds the per-query allow-list and
//! runs tools with panic isolation.

mod fs;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use indexmap::IndexMap;
use serde_json::Value;
use stepwise_protocol::{Tool, ToolContext, ToolError, ToolErrorKind, ToolSchema};
use tracing::{debug, instrument, warn};

pub use fs::{ReadFileTool, WriteFileTool};

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: IndexMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    /// Registering a name twice replaces the earlier tool in place.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_owned(), tool);
    }

    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|tool| tool.schema()).collect()
    }

    /// Workspace file tools rooted at `ToolContext::fs_root`.
    pub fn with_core_tools() -> Self {
        Self::default().with(ReadFileTool).with(WriteFileTool)
    }
}

/// Registry plus an optional allow-list of name patterns.
#[derive(Debug, Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    allowed: Option<Vec<String>>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            allowed: None,
        }
    }

    /// `None` allows every registered tool.
    pub fn with_allowed(mut self, allowed: Option<Vec<String>>) -> Self {
        self.allowed = allowed;
        self
    }

    pub fn registry(&self) -> Arc<ToolRegistry> {
        self.registry.clone()
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        match &self.allowed {
            None => true,
            Some(patterns) => patterns
                .iter()
                .any(|pattern| stepwise_policy::matches(pattern, name)),
        }
    }

    /// Schemas of allowed tools, in registration order.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.registry
            .tools
            .iter()
            .filter(|(name, _)| self.is_allowed(name))
            .map(|(_, tool)| tool.schema())
            .collect()
    }

    /// Look up a tool the model asked for, enforcing the allow-list.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>, ToolError> {
        let tool = self.registry.get(name).ok_or_else(|| {
            ToolError::new(ToolErrorKind::UnknownTool, format!("unknown tool: {name}"))
        })?;
        if !self.is_allowed(name) {
            return Err(ToolError::new(
                ToolErrorKind::ToolNotAllowed,
                format!("tool {name} is not in the allowed tool list"),
            ));
        }
        Ok(tool)
    }

    /// Run a resolved tool. Non-object input is rejected before the tool
    /// sees it; a panic becomes an execution error.
    #[instrument(skip_all, fields(tool = tool.name(), session_id = %ctx.session_id))]
    pub async fn execute(
        &self,
        tool: &dyn Tool,
        input: Value,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        if !input.is_object() {
            return Err(ToolError::invalid_input(format!(
                "tool input must be a JSON object, got {}",
                json_type(&input)
            )));
        }
        match AssertUnwindSafe(tool.run(input, ctx)).catch_unwind().await {
            Ok(Ok(output)) => {
                debug!("tool execution finished");
                Ok(output)
            }
            Ok(Err(err)) => {
                debug!(error = %err, "tool execution failed");
                Err(err)
            }
            Err(panic) => {
                let message = format!("tool panicked: {}", panic_message(panic.as_ref()));
                warn!("{message}");
                Err(ToolError::execution(message))
            }
        }
    }

    /// Resolve then execute.
    pub async fn dispatch(
        &self,
        name: &str,
        input: Value,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        let tool = self.resolve(name)?;
        self.execute(tool.as_ref(), input, ctx).await
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// A tool backed by a synchronous closure.
pub struct FnTool<F> {
    schema: ToolSchema,
    func: F,
}

impl<F> FnTool<F>
where
    F: Fn(Value, &ToolContext) -> Result<Value, ToolError> + Send + Sync,
{
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        func: F,
    ) -> Self {
        Self {
            schema: ToolSchema {
                name: name.into(),
                description: description.into(),
                parameters,
            },
            func,
        }
    }
}

#[async_trait]
impl<F> Tool for FnTool<F>
where
    F: Fn(Value, &ToolContext) -> Result<Value, ToolError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.schema.name
    }

    fn schema(&self) -> ToolSchema {
        self.schema.clone()
    }

    async fn run(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        (self.func)(input, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_protocol::SessionId;

    fn echo() -> impl Tool {
        FnTool::new(
            "echo",
            "Echo the input back",
            json!({"type": "object"}),
            |input, _| Ok(input),
        )
    }

    fn ctx() -> ToolContext {
        ToolContext::new(SessionId::default(), std::env::temp_dir())
    }

    #[test]
    fn schemas_follow_registration_order() {
        let registry = ToolRegistry::default()
            .with(FnTool::new("zeta", "", json!({}), |v, _| Ok(v)))
            .with(echo())
            .with(FnTool::new("alpha", "", json!({}), |v, _| Ok(v)));
        let names: Vec<_> = registry.schemas().into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["zeta", "echo", "alpha"]);
    }

    #[tokio::test]
    async fn unknown_and_disallowed_tools_are_typed_errors() {
        let registry = Arc::new(
            ToolRegistry::default()
                .with(echo())
                .with(FnTool::new("bash", "", json!({}), |v, _| Ok(v))),
        );
        let dispatcher = ToolDispatcher::new(registry).with_allowed(Some(vec!["ech*".into()]));

        let err = dispatcher.dispatch("missing", json!({}), &ctx()).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::UnknownTool);

        let err = dispatcher.dispatch("bash", json!({}), &ctx()).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::ToolNotAllowed);

        let names: Vec<_> = dispatcher.schemas().into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["echo"]);

        let out = dispatcher
            .dispatch("echo", json!({"x": 1}), &ctx())
            .await
            .unwrap();
        assert_eq!(out, json!({"x": 1}));
    }

    #[tokio::test]
    async fn non_object_input_is_rejected() {
        let dispatcher = ToolDispatcher::new(Arc::new(ToolRegistry::default().with(echo())));
        let err = dispatcher.dispatch("echo", json!([1, 2]), &ctx()).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::InvalidInput);
        assert!(err.message.contains("array"));
    }

    #[tokio::test]
    async fn panicking_tool_becomes_execution_error() {
        let dispatcher = ToolDispatcher::new(Arc::new(ToolRegistry::default().with(
            FnTool::new("explode", "", json!({}), |_, _| panic!("kaboom")),
        )));
        let err = dispatcher.dispatch("explode", json!({}), &ctx()).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::Execution);
        assert_eq!(err.message, "tool panicked: kaboom");
    }
}
