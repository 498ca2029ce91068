//! Responses-style wire protocol (`POST /responses`).
//!
//! The universal history items map almost one-to-one onto Responses input
//! items. This is the only protocol with reply threading
//! (`previous_response_id`).

use serde_json::{Map, Value, json};
use stepwise_protocol::{
    InputItem, ModelOutput, ModelRequest, ProviderError, StreamEvent, ToolCall, Usage,
};

use crate::StreamDecoder;
use crate::accumulate::{OutputAccumulator, json_str, json_u64, parse_arguments};
use crate::sse::SseEvent;

pub const TERMINAL_EVENT: &str = "response.completed";

pub fn build_body(request: &ModelRequest, stream: bool) -> Value {
    let input: Vec<Value> = request
        .items
        .iter()
        .map(|item| match item {
            InputItem::Message { role, content } => json!({
                "type": "message",
                "role": role.as_str(),
                "content": content,
            }),
            InputItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => json!({
                "type": "function_call",
                "call_id": call_id,
                "name": name,
                "arguments": arguments,
            }),
            InputItem::FunctionCallOutput { call_id, output } => json!({
                "type": "function_call_output",
                "call_id": call_id,
                "output": output,
            }),
        })
        .collect();

    let mut body = json!({
        "model": request.model,
        "input": input,
        "stream": stream,
    });
    if let Some(instructions) = &request.instructions {
        body["instructions"] = json!(instructions);
    }
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    })
                })
                .collect(),
        );
    }
    if let Some(previous) = &request.previous_response_id {
        body["previous_response_id"] = json!(previous);
    }
    if let Some(max) = request.max_output_tokens {
        body["max_output_tokens"] = json!(max);
    }
    body
}

fn parse_usage(value: &Value) -> Option<Usage> {
    if !value.is_object() {
        return None;
    }
    let cached = value["input_tokens_details"]["cached_tokens"]
        .as_u64()
        .unwrap_or(0);
    Some(Usage {
        input_tokens: json_u64(value, "input_tokens").saturating_sub(cached),
        output_tokens: json_u64(value, "output_tokens"),
        cache_read_tokens: cached,
        cache_write_tokens: 0,
    })
}

fn error_message(response: &Value) -> String {
    let error = &response["error"];
    match error["message"].as_str() {
        Some(message) => message.to_owned(),
        None if !error.is_null() => error.to_string(),
        None => "response failed".to_owned(),
    }
}

pub fn parse_response(value: &Value) -> Result<ModelOutput, ProviderError> {
    let output = value["output"]
        .as_array()
        .ok_or_else(|| ProviderError::invalid_response(value.to_string()))?;
    if value["status"].as_str() == Some("failed") {
        return Err(ProviderError::invalid_response(error_message(value)));
    }

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for item in output {
        match item["type"].as_str() {
            Some("message") => {
                for part in item["content"].as_array().into_iter().flatten() {
                    if part["type"].as_str() == Some("output_text") {
                        text.push_str(part["text"].as_str().unwrap_or_default());
                    }
                }
            }
            Some("function_call") => tool_calls.push(ToolCall {
                id: json_str(item, "call_id"),
                name: json_str(item, "name"),
                arguments: parse_arguments(item["arguments"].as_str().unwrap_or_default()),
            }),
            _ => {}
        }
    }

    let mut meta = Map::new();
    if let Some(status) = value["status"].as_str() {
        meta.insert("status".into(), json!(status));
    }
    Ok(ModelOutput {
        text: (!text.is_empty()).then_some(text),
        tool_calls,
        usage: parse_usage(&value["usage"]),
        response_id: value["id"].as_str().map(str::to_owned),
        provider_meta: (!meta.is_empty()).then_some(Value::Object(meta)),
    })
}

/// Folds `response.*` events into one output.
#[derive(Debug, Default)]
pub struct ResponsesDecoder {
    acc: OutputAccumulator,
    finished: bool,
}

impl ResponsesDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn complete(&mut self, response: &Value) -> StreamEvent {
        self.finished = true;
        let acc = std::mem::take(&mut self.acc);
        if acc.is_empty()
            && let Ok(parsed) = parse_response(response)
        {
            return StreamEvent::Completed(parsed);
        }
        let mut output = acc.into_output();
        if let Some(usage) = parse_usage(&response["usage"]) {
            output.usage = Some(usage);
        }
        if let Some(id) = response["id"].as_str() {
            output.response_id = Some(id.to_owned());
        }
        StreamEvent::Completed(output)
    }
}

impl StreamDecoder for ResponsesDecoder {
    fn decode(&mut self, event: &SseEvent) -> Vec<StreamEvent> {
        if self.finished || event.is_done_marker() {
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
        let index = json_u64(&value, "output_index");

        match kind {
            "response.created" | "response.in_progress" => {
                if let Some(id) = value["response"]["id"].as_str() {
                    self.acc.response_id = Some(id.to_owned());
                }
                Vec::new()
            }
            "response.output_text.delta" => {
                let delta = json_str(&value, "delta");
                if delta.is_empty() {
                    return Vec::new();
                }
                self.acc.text.push_str(&delta);
                vec![StreamEvent::TextDelta(delta)]
            }
            "response.output_item.added" | "response.output_item.done" => {
                let item = &value["item"];
                if item["type"].as_str() == Some("function_call") {
                    let tool = self.acc.tool(index);
                    tool.id = json_str(item, "call_id");
                    tool.name = json_str(item, "name");
                    if let Some(arguments) = item["arguments"].as_str()
                        && !arguments.is_empty()
                    {
                        tool.arguments = arguments.to_owned();
                    }
                }
                Vec::new()
            }
            "response.function_call_arguments.delta" => {
                self.acc
                    .tool(index)
                    .arguments
                    .push_str(&json_str(&value, "delta"));
                Vec::new()
            }
            "response.function_call_arguments.done" => {
                if let Some(arguments) = value["arguments"].as_str() {
                    self.acc.tool(index).arguments = arguments.to_owned();
                }
                Vec::new()
            }
            TERMINAL_EVENT => vec![self.complete(&value["response"])],
            "response.incomplete" => {
                let reason = value["response"]["incomplete_details"]["reason"]
                    .as_str()
                    .unwrap_or("unknown")
                    .to_owned();
                self.acc.meta.insert("incomplete".into(), json!(reason));
                vec![self.complete(&value["response"])]
            }
            "response.failed" => {
                self.finished = true;
                vec![StreamEvent::Failed(error_message(&value["response"]))]
            }
            "error" => {
                self.finished = true;
                let message = value["message"]
                    .as_str()
                    .map(str::to_owned)
                    .unwrap_or_else(|| error_message(&value));
                vec![StreamEvent::Failed(message)]
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::decode_bytes;
    use stepwise_protocol::ToolSchema;

    #[test]
    fn body_carries_items_tools_and_threading() {
        let mut request = ModelRequest::new(
            "gpt-test",
            vec![
                InputItem::user("hi"),
                InputItem::FunctionCall {
                    call_id: "c1".into(),
                    name: "ls".into(),
                    arguments: "{}".into(),
                },
                InputItem::FunctionCallOutput {
                    call_id: "c1".into(),
                    output: "a.txt".into(),
                },
            ],
        );
        request.instructions = Some("be brief".into());
        request.previous_response_id = Some("resp_0".into());
        request.tools.push(ToolSchema {
            name: "ls".into(),
            description: "list".into(),
            parameters: json!({"type": "object"}),
        });

        let body = build_body(&request, true);
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["instructions"], json!("be brief"));
        assert_eq!(body["previous_response_id"], json!("resp_0"));
        assert_eq!(body["input"][0]["role"], json!("user"));
        assert_eq!(body["input"][1]["type"], json!("function_call"));
        assert_eq!(body["input"][2]["output"], json!("a.txt"));
        assert_eq!(body["tools"][0]["type"], json!("function"));
    }

    #[test]
    fn parses_text_and_function_calls() {
        let value = json!({
            "id": "resp_1",
            "status": "completed",
            "output": [
                {"type": "message", "content": [{"type": "output_text", "text": "Hello"}]},
                {"type": "function_call", "call_id": "c1", "name": "ls", "arguments": "{\"dir\":\".\"}"}
            ],
            "usage": {"input_tokens": 100, "output_tokens": 7, "input_tokens_details": {"cached_tokens": 40}}
        });
        let output = parse_response(&value).unwrap();
        assert_eq!(output.text.as_deref(), Some("Hello"));
        assert_eq!(output.tool_calls[0].arguments, json!({"dir": "."}));
        assert_eq!(output.response_id.as_deref(), Some("resp_1"));
        let usage = output.usage.unwrap();
        assert_eq!(usage.input_tokens, 60);
        assert_eq!(usage.cache_read_tokens, 40);
    }

    #[test]
    fn missing_output_is_invalid() {
        let err = parse_response(&json!({"id": "x"})).unwrap_err();
        assert_eq!(err.kind(), "invalid_response");
    }

    const STREAM: &str = concat!(
        "event: response.created\n",
        "data: {\"type\":\"response.created\",\"response\":{\"id\":\"resp_9\"}}\n\n",
        "event: response.output_text.delta\n",
        "data: {\"type\":\"response.output_text.delta\",\"delta\":\"Hel\"}\n\n",
        "event: response.output_text.delta\n",
        "data: {\"type\":\"response.output_text.delta\",\"delta\":\"lo\"}\n\n",
        "event: response.output_item.added\n",
        "data: {\"type\":\"response.output_item.added\",\"output_index\":1,\"item\":{\"type\":\"function_call\",\"call_id\":\"c1\",\"name\":\"ls\",\"arguments\":\"\"}}\n\n",
        "event: response.function_call_arguments.delta\n",
        "data: {\"type\":\"response.function_call_arguments.delta\",\"output_index\":1,\"delta\":\"{\\\"dir\\\":\"}\n\n",
        "event: response.function_call_arguments.delta\n",
        "data: {\"type\":\"response.function_call_arguments.delta\",\"output_index\":1,\"delta\":\"\\\".\\\"}\"}\n\n",
        "event: response.completed\n",
        "data: {\"type\":\"response.completed\",\"response\":{\"id\":\"resp_9\",\"output\":[],\"usage\":{\"input_tokens\":10,\"output_tokens\":3}}}\n\n",
    );

    #[test]
    fn stream_assembles_text_and_arguments_across_byte_splits() {
        for chunk_size in [1, 7, STREAM.len()] {
            let events = decode_bytes(Box::new(ResponsesDecoder::new()), STREAM.as_bytes(), chunk_size);
            let deltas: Vec<&StreamEvent> = events
                .iter()
                .filter(|e| matches!(e, StreamEvent::TextDelta(_)))
                .collect();
            assert_eq!(deltas.len(), 2);
            let Some(StreamEvent::Completed(output)) = events.last() else {
                panic!("expected completion, got {events:?}");
            };
            assert_eq!(output.text.as_deref(), Some("Hello"));
            assert_eq!(output.tool_calls[0].name, "ls");
            assert_eq!(output.tool_calls[0].arguments, json!({"dir": "."}));
            assert_eq!(output.response_id.as_deref(), Some("resp_9"));
            assert_eq!(output.usage.map(|u| u.output_tokens), Some(3));
        }
    }

    #[test]
    fn stream_without_completion_fails() {
        let cut = STREAM.find("event: response.completed").unwrap();
        let events = decode_bytes(Box::new(ResponsesDecoder::new()), &STREAM.as_bytes()[..cut], 16);
        assert!(matches!(events.last(), Some(StreamEvent::Failed(msg)) if msg.contains(TERMINAL_EVENT)));
    }

    #[test]
    fn failed_event_reports_message() {
        let stream = "data: {\"type\":\"response.failed\",\"response\":{\"error\":{\"message\":\"boom\"}}}\n\n";
        let events = decode_bytes(Box::new(ResponsesDecoder::new()), stream.as_bytes(), 5);
        assert_eq!(events, vec![StreamEvent::Failed("boom".into())]);
    }
}
