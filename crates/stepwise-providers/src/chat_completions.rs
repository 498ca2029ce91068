//! Chat-Completions-style wire protocol (`POST /chat/completions`).
//!
//! Function calls attach to the preceding assistant message as `tool_calls`;
//! function outputs become `role: "tool"` messages.

use serde_json::{Map, Value, json};
use stepwise_protocol::{
    InputItem, ModelOutput, ModelRequest, ProviderError, Role, StreamEvent, ToolCall, Usage,
};

use crate::StreamDecoder;
use crate::accumulate::{OutputAccumulator, json_str, json_u64, parse_arguments};
use crate::sse::SseEvent;

pub const TERMINAL_EVENT: &str = "[DONE]";

/// Convert universal items to the Chat Completions `messages` array.
pub fn items_to_messages(instructions: Option<&str>, items: &[InputItem]) -> Vec<Value> {
    let mut messages: Vec<Value> = Vec::with_capacity(items.len() + 1);
    if let Some(instructions) = instructions {
        messages.push(json!({"role": "system", "content": instructions}));
    }

    for item in items {
        match item {
            InputItem::Message { role, content } => {
                messages.push(json!({"role": role.as_str(), "content": content}));
            }
            InputItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                let call = json!({
                    "id": call_id,
                    "type": "function",
                    "function": {"name": name, "arguments": arguments},
                });
                let attach = messages.last().is_some_and(|last| {
                    last["role"] == json!(Role::Assistant.as_str())
                        && (last["tool_calls"].is_array() || last["content"].is_string())
                });
                match messages.last_mut() {
                    Some(last) if attach => match last["tool_calls"].as_array_mut() {
                        Some(calls) => calls.push(call),
                        None => last["tool_calls"] = json!([call]),
                    },
                    _ => messages.push(json!({
                        "role": "assistant",
                        "content": Value::Null,
                        "tool_calls": [call],
                    })),
                }
            }
            InputItem::FunctionCallOutput { call_id, output } => {
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": output,
                }));
            }
        }
    }
    messages
}

pub fn build_body(request: &ModelRequest, stream: bool) -> Value {
    let mut body = json!({
        "model": request.model,
        "messages": items_to_messages(request.instructions.as_deref(), &request.items),
        "stream": stream,
    });
    if stream {
        body["stream_options"] = json!({"include_usage": true});
    }
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect(),
        );
    }
    if let Some(max) = request.max_output_tokens {
        body["max_tokens"] = json!(max);
    }
    body
}

fn parse_usage(value: &Value) -> Option<Usage> {
    if !value.is_object() {
        return None;
    }
    let cached = value["prompt_tokens_details"]["cached_tokens"]
        .as_u64()
        .unwrap_or(0);
    Some(Usage {
        input_tokens: json_u64(value, "prompt_tokens").saturating_sub(cached),
        output_tokens: json_u64(value, "completion_tokens"),
        cache_read_tokens: cached,
        cache_write_tokens: 0,
    })
}

fn finish_reason_meta(reason: Option<&str>) -> Option<Value> {
    reason.map(|reason| {
        let mut meta = Map::new();
        meta.insert("finish_reason".into(), json!(reason));
        Value::Object(meta)
    })
}

pub fn parse_response(value: &Value) -> Result<ModelOutput, ProviderError> {
    let choice = value["choices"]
        .as_array()
        .and_then(|choices| choices.first())
        .ok_or_else(|| ProviderError::invalid_response(value.to_string()))?;
    let message = &choice["message"];

    let tool_calls = message["tool_calls"]
        .as_array()
        .into_iter()
        .flatten()
        .map(|call| ToolCall {
            id: json_str(call, "id"),
            name: json_str(&call["function"], "name"),
            arguments: parse_arguments(call["function"]["arguments"].as_str().unwrap_or_default()),
        })
        .collect();

    Ok(ModelOutput {
        text: message["content"]
            .as_str()
            .filter(|text| !text.is_empty())
            .map(str::to_owned),
        tool_calls,
        usage: parse_usage(&value["usage"]),
        response_id: value["id"].as_str().map(str::to_owned),
        provider_meta: finish_reason_meta(choice["finish_reason"].as_str()),
    })
}

/// Folds `chat.completion.chunk` frames until `data: [DONE]`.
#[derive(Debug, Default)]
pub struct ChatCompletionsDecoder {
    acc: OutputAccumulator,
    finished: bool,
}

impl ChatCompletionsDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamDecoder for ChatCompletionsDecoder {
    fn decode(&mut self, event: &SseEvent) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        if event.is_done_marker() {
            self.finished = true;
            let acc = std::mem::take(&mut self.acc);
            return vec![StreamEvent::Completed(acc.into_output())];
        }
        let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
            tracing::trace!(data = %event.data, "ignoring non-JSON SSE data");
            return Vec::new();
        };
        if !value["error"].is_null() {
            self.finished = true;
            let message = value["error"]["message"]
                .as_str()
                .map(str::to_owned)
                .unwrap_or_else(|| value["error"].to_string());
            return vec![StreamEvent::Failed(message)];
        }

        if self.acc.response_id.is_none()
            && let Some(id) = value["id"].as_str()
        {
            self.acc.response_id = Some(id.to_owned());
        }
        if let Some(usage) = parse_usage(&value["usage"]) {
            self.acc.usage = Some(usage);
        }

        let mut out = Vec::new();
        for choice in value["choices"].as_array().into_iter().flatten() {
            let delta = &choice["delta"];
            if let Some(text) = delta["content"].as_str()
                && !text.is_empty()
            {
                self.acc.text.push_str(text);
                out.push(StreamEvent::TextDelta(text.to_owned()));
            }
            for call in delta["tool_calls"].as_array().into_iter().flatten() {
                let tool = self.acc.tool(json_u64(call, "index"));
                if let Some(id) = call["id"].as_str() {
                    tool.id = id.to_owned();
                }
                if let Some(name) = call["function"]["name"].as_str() {
                    tool.name.push_str(name);
                }
                if let Some(arguments) = call["function"]["arguments"].as_str() {
                    tool.arguments.push_str(arguments);
                }
            }
            if let Some(reason) = choice["finish_reason"].as_str() {
                self.acc
                    .meta
                    .insert("finish_reason".into(), json!(reason));
            }
        }
        out
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn terminal_marker(&self) -> &'static str {
        TERMINAL_EVENT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::decode_bytes;

    #[test]
    fn function_calls_attach_to_assistant_message() {
        let items = vec![
            InputItem::user("list"),
            InputItem::assistant("let me look"),
            InputItem::FunctionCall {
                call_id: "c1".into(),
                name: "ls".into(),
                arguments: "{}".into(),
            },
            InputItem::FunctionCall {
                call_id: "c2".into(),
                name: "pwd".into(),
                arguments: "{}".into(),
            },
            InputItem::FunctionCallOutput {
                call_id: "c1".into(),
                output: "a.txt".into(),
            },
            InputItem::FunctionCallOutput {
                call_id: "c2".into(),
                output: "/".into(),
            },
        ];
        let messages = items_to_messages(Some("sys"), &items);
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0]["role"], json!("system"));
        assert_eq!(messages[2]["content"], json!("let me look"));
        assert_eq!(messages[2]["tool_calls"].as_array().unwrap().len(), 2);
        assert_eq!(messages[3]["role"], json!("tool"));
        assert_eq!(messages[4]["tool_call_id"], json!("c2"));
    }

    #[test]
    fn bare_function_call_gets_its_own_assistant_message() {
        let items = vec![
            InputItem::user("go"),
            InputItem::FunctionCall {
                call_id: "c1".into(),
                name: "ls".into(),
                arguments: "{}".into(),
            },
        ];
        let messages = items_to_messages(None, &items);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1]["content"], Value::Null);
        assert_eq!(messages[1]["tool_calls"][0]["id"], json!("c1"));
    }

    #[test]
    fn parses_tool_call_response() {
        let value = json!({
            "id": "chatcmpl-1",
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "content": null,
                    "tool_calls": [{"id": "c1", "type": "function", "function": {"name": "ls", "arguments": "{\"dir\":\"/\"}"}}]
                }
            }],
            "usage": {"prompt_tokens": 20, "completion_tokens": 5}
        });
        let output = parse_response(&value).unwrap();
        assert_eq!(output.text, None);
        assert_eq!(output.tool_calls[0].arguments, json!({"dir": "/"}));
        assert_eq!(output.usage.unwrap().input_tokens, 20);
        assert_eq!(output.provider_meta, Some(json!({"finish_reason": "tool_calls"})));
    }

    #[test]
    fn empty_choices_is_invalid() {
        let err = parse_response(&json!({"choices": []})).unwrap_err();
        assert_eq!(err.kind(), "invalid_response");
    }

    const STREAM: &str = concat!(
        "data: {\"id\":\"cc1\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hi \"}}]}\n\n",
        "data: {\"id\":\"cc1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"there\"}}]}\n\n",
        "data: {\"id\":\"cc1\",\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c1\",\"function\":{\"name\":\"ls\",\"arguments\":\"{\\\"d\"}}]}}]}\n\n",
        "data: {\"id\":\"cc1\",\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"ir\\\":1}\"}}]},\"finish_reason\":\"tool_calls\"}]}\n\n",
        "data: {\"id\":\"cc1\",\"choices\":[],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":4}}\n\n",
        "data: [DONE]\n\n",
    );

    #[test]
    fn stream_completes_on_done_marker() {
        for chunk_size in [1, 3, 64, STREAM.len()] {
            let events = decode_bytes(
                Box::new(ChatCompletionsDecoder::new()),
                STREAM.as_bytes(),
                chunk_size,
            );
            assert_eq!(events[0], StreamEvent::TextDelta("Hi ".into()));
            let Some(StreamEvent::Completed(output)) = events.last() else {
                panic!("expected completion, got {events:?}");
            };
            assert_eq!(output.text.as_deref(), Some("Hi there"));
            assert_eq!(output.tool_calls[0].id, "c1");
            assert_eq!(output.tool_calls[0].arguments, json!({"dir": 1}));
            assert_eq!(output.usage.map(|u| u.output_tokens), Some(4));
            assert_eq!(output.response_id.as_deref(), Some("cc1"));
        }
    }

    #[test]
    fn stream_without_done_fails() {
        let cut = STREAM.find("data: [DONE]").unwrap();
        let events = decode_bytes(
            Box::new(ChatCompletionsDecoder::new()),
            &STREAM.as_bytes()[..cut],
            10,
        );
        assert!(matches!(events.last(), Some(StreamEvent::Failed(_))));
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Completed(_))));
    }

    #[test]
    fn error_frame_fails_the_stream() {
        let stream = "data: {\"error\":{\"message\":\"overloaded\"}}\n\n";
        let events = decode_bytes(Box::new(ChatCompletionsDecoder::new()), stream.as_bytes(), 4);
        assert_eq!(events, vec![StreamEvent::Failed("overloaded".into())]);
    }
}
