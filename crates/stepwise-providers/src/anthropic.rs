//! Anthropic-Messages-style wire protocol (`POST /messages`).
//!
//! Content is block-structured: function calls become `tool_use` blocks on
//! the assistant turn and outputs become `tool_result` blocks on the next
//! user turn. Consecutive items with the same role merge into one message.

use serde_json::{Map, Value, json};
use stepwise_protocol::{
    InputItem, ModelOutput, ModelRequest, ProviderError, Role, StreamEvent, ToolCall, Usage,
};

use crate::StreamDecoder;
use crate::accumulate::{OutputAccumulator, json_str, json_u64, parse_arguments};
use crate::sse::SseEvent;

pub const TERMINAL_EVENT: &str = "message_stop";

/// `max_tokens` is mandatory for this protocol.
pub const DEFAULT_MAX_TOKENS: u32 = 8_192;

fn push_block(messages: &mut Vec<Value>, role: &str, block: Value) {
    if let Some(last) = messages.last_mut()
        && last["role"].as_str() == Some(role)
        && let Some(content) = last["content"].as_array_mut()
    {
        content.push(block);
        return;
    }
    messages.push(json!({"role": role, "content": [block]}));
}

/// Convert universal items to `(system, messages)`.
pub fn items_to_messages(
    instructions: Option<&str>,
    items: &[InputItem],
) -> (Option<String>, Vec<Value>) {
    let mut system: Option<String> = instructions.map(str::to_owned);
    let mut messages: Vec<Value> = Vec::with_capacity(items.len());

    for item in items {
        match item {
            InputItem::Message {
                role: Role::System,
                content,
            } => match &mut system {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(content);
                }
                None => system = Some(content.clone()),
            },
            InputItem::Message { role, content } => {
                if content.is_empty() {
                    continue;
                }
                push_block(
                    &mut messages,
                    role.as_str(),
                    json!({"type": "text", "text": content}),
                );
            }
            InputItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                let input = match parse_arguments(arguments) {
                    Value::Object(map) => Value::Object(map),
                    _ => Value::Object(Map::new()),
                };
                push_block(
                    &mut messages,
                    Role::Assistant.as_str(),
                    json!({"type": "tool_use", "id": call_id, "name": name, "input": input}),
                );
            }
            InputItem::FunctionCallOutput { call_id, output } => {
                push_block(
                    &mut messages,
                    Role::User.as_str(),
                    json!({"type": "tool_result", "tool_use_id": call_id, "content": output}),
                );
            }
        }
    }
    (system, messages)
}

pub fn build_body(request: &ModelRequest, stream: bool) -> Value {
    let (system, messages) = items_to_messages(request.instructions.as_deref(), &request.items);
    let mut body = json!({
        "model": request.model,
        "max_tokens": request.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
        "stream": stream,
    });
    if let Some(system) = system {
        body["system"] = json!(system);
    }
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.parameters,
                    })
                })
                .collect(),
        );
    }
    body
}

fn parse_usage(value: &Value) -> Option<Usage> {
    if !value.is_object() {
        return None;
    }
    Some(Usage {
        input_tokens: json_u64(value, "input_tokens"),
        output_tokens: json_u64(value, "output_tokens"),
        cache_read_tokens: json_u64(value, "cache_read_input_tokens"),
        cache_write_tokens: json_u64(value, "cache_creation_input_tokens"),
    })
}

fn stop_reason_meta(reason: Option<&str>) -> Option<Value> {
    reason.map(|reason| json!({"stop_reason": reason}))
}

pub fn parse_response(value: &Value) -> Result<ModelOutput, ProviderError> {
    if value["type"].as_str() == Some("error") {
        return Err(ProviderError::invalid_response(value.to_string()));
    }
    let content = value["content"]
        .as_array()
        .ok_or_else(|| ProviderError::invalid_response(value.to_string()))?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in content {
        match block["type"].as_str() {
            Some("text") => text.push_str(block["text"].as_str().unwrap_or_default()),
            Some("tool_use") => tool_calls.push(ToolCall {
                id: json_str(block, "id"),
                name: json_str(block, "name"),
                arguments: block["input"].clone(),
            }),
            _ => {}
        }
    }

    Ok(ModelOutput {
        text: (!text.is_empty()).then_some(text),
        tool_calls,
        usage: parse_usage(&value["usage"]),
        response_id: value["id"].as_str().map(str::to_owned),
        provider_meta: stop_reason_meta(value["stop_reason"].as_str()),
    })
}

/// Folds `message_*` / `content_block_*` events until `message_stop`.
#[derive(Debug, Default)]
pub struct AnthropicDecoder {
    acc: OutputAccumulator,
    finished: bool,
}

impl AnthropicDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamDecoder for AnthropicDecoder {
    fn decode(&mut self, event: &SseEvent) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
            tracing::trace!(data = %event.data, "ignoring non-JSON SSE data");
            return Vec::new();
        };
        let kind = value["type"]
            .as_str()
            .or(event.event.as_deref())
            .unwrap_or_default();
        let index = json_u64(&value, "index");

        match kind {
            "message_start" => {
                let message = &value["message"];
                if let Some(id) = message["id"].as_str() {
                    self.acc.response_id = Some(id.to_owned());
                }
                self.acc.usage = parse_usage(&message["usage"]);
                Vec::new()
            }
            "content_block_start" => {
                let block = &value["content_block"];
                match block["type"].as_str() {
                    Some("tool_use") => {
                        let tool = self.acc.tool(index);
                        tool.id = json_str(block, "id");
                        tool.name = json_str(block, "name");
                        Vec::new()
                    }
                    Some("text") => {
                        let text = json_str(block, "text");
                        if text.is_empty() {
                            return Vec::new();
                        }
                        self.acc.text.push_str(&text);
                        vec![StreamEvent::TextDelta(text)]
                    }
                    _ => Vec::new(),
                }
            }
            "content_block_delta" => {
                let delta = &value["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        let text = json_str(delta, "text");
                        if text.is_empty() {
                            return Vec::new();
                        }
                        self.acc.text.push_str(&text);
                        vec![StreamEvent::TextDelta(text)]
                    }
                    Some("input_json_delta") => {
                        self.acc
                            .tool(index)
                            .arguments
                            .push_str(&json_str(delta, "partial_json"));
                        Vec::new()
                    }
                    other => {
                        tracing::trace!(delta_type = ?other, "ignoring delta type");
                        Vec::new()
                    }
                }
            }
            "message_delta" => {
                if let Some(reason) = value["delta"]["stop_reason"].as_str() {
                    self.acc.meta.insert("stop_reason".into(), json!(reason));
                }
                if let Some(output_tokens) = value["usage"]["output_tokens"].as_u64() {
                    let usage = self.acc.usage.get_or_insert_with(Usage::default);
                    usage.output_tokens = output_tokens;
                }
                Vec::new()
            }
            TERMINAL_EVENT => {
                self.finished = true;
                let acc = std::mem::take(&mut self.acc);
                vec![StreamEvent::Completed(acc.into_output())]
            }
            "error" => {
                self.finished = true;
                let message = value["error"]["message"]
                    .as_str()
                    .map(str::to_owned)
                    .unwrap_or_else(|| value["error"].to_string());
                vec![StreamEvent::Failed(message)]
            }
            // ping, content_block_stop
            _ => Vec::new(),
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn terminal_marker(&self) -> &'static str {
        TERMINAL_EVENT
    }
}
