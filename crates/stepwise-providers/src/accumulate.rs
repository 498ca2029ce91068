//! Per-call output accumulation shared by the streaming decoders.

use indexmap::IndexMap;
use serde_json::{Map, Value};
use stepwise_protocol::{ModelOutput, ToolCall, Usage};

/// Arguments of one tool call, assembled from incremental JSON fragments.
#[derive(Debug, Default, Clone)]
pub(crate) struct ToolCallBuilder {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCallBuilder {
    pub fn build(self) -> ToolCall {
        ToolCall {
            id: self.id,
            name: self.name,
            arguments: parse_arguments(&self.arguments),
        }
    }
}

/// Parse model-produced arguments. Empty means no arguments; text that is
/// not valid JSON is passed through as a string for the tool to reject.
pub(crate) fn parse_arguments(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Object(Map::new());
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

/// Text plus tool-call builders keyed by the provider's block/output index.
#[derive(Debug, Default)]
pub(crate) struct OutputAccumulator {
    pub text: String,
    pub tools: IndexMap<u64, ToolCallBuilder>,
    pub usage: Option<Usage>,
    pub response_id: Option<String>,
    pub meta: Map<String, Value>,
}

impl OutputAccumulator {
    pub fn tool(&mut self, index: u64) -> &mut ToolCallBuilder {
        self.tools.entry(index).or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.tools.is_empty()
    }

    pub fn into_output(self) -> ModelOutput {
        ModelOutput {
            text: (!self.text.is_empty()).then_some(self.text),
            tool_calls: self
                .tools
                .into_values()
                .filter(|builder| !builder.name.is_empty())
                .map(ToolCallBuilder::build)
                .collect(),
            usage: self.usage,
            response_id: self.response_id,
            provider_meta: (!self.meta.is_empty()).then_some(Value::Object(self.meta)),
        }
    }
}

pub(crate) fn json_str(value: &Value, key: &str) -> String {
    value[key].as_str().unwrap_or_default().to_owned()
}

pub(crate) fn json_u64(value: &Value, key: &str) -> u64 {
    value[key].as_u64().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn arguments_assemble_from_fragments() {
        let mut acc = OutputAccumulator::default();
        let tool = acc.tool(1);
        tool.id = "call_1".into();
        tool.name = "read".into();
        for part in ["{\"pa", "th\":", "\"a.txt\"}"] {
            acc.tool(1).arguments.push_str(part);
        }
        let output = acc.into_output();
        assert_eq!(output.tool_calls[0].arguments, json!({"path": "a.txt"}));
        assert_eq!(output.text, None);
    }

    #[test]
    fn empty_and_invalid_arguments() {
        assert_eq!(parse_arguments("  "), json!({}));
        assert_eq!(parse_arguments("{oops"), Value::String("{oops".into()));
    }

    #[test]
    fn tool_order_follows_first_appearance() {
        let mut acc = OutputAccumulator::default();
        acc.tool(5).name = "b".into();
        acc.tool(2).name = "a".into();
        let names: Vec<String> = acc
            .into_output()
            .tool_calls
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["b", "a"]);
    }
}
