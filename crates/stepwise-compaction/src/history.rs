//! Compaction-aware rendering of a session log into provider input items.

use std::collections::HashSet;

use serde_json::Value;
use stepwise_protocol::{EventKind, EventRecord, InputItem, SeqNo};

/// Rendered in place of a pruned tool output.
pub const PRUNED_PLACEHOLDER: &str = "[Old tool result content cleared]";

/// Rendered for a logged tool call that never produced a result.
pub const INTERRUPTED_OUTPUT: &str = "[Tool execution was interrupted]";

/// User turn rendered for a `UserCompaction` event.
pub const COMPACTION_PROMPT: &str = "What did we do so far?";

/// Ids of every tool call whose output has been marked compacted.
pub fn compacted_ids(events: &[EventRecord]) -> HashSet<&str> {
    events
        .iter()
        .filter_map(|event| match &event.kind {
            EventKind::ToolOutputCompacted { tool_use_id } => Some(tool_use_id.as_str()),
            _ => None,
        })
        .collect()
}

/// Index where context rendering starts: the `UserCompaction` that opened
/// the latest summary, the summary itself if there is none, else `0`.
pub fn pivot_index(events: &[EventRecord]) -> usize {
    let Some(summary) = events.iter().rposition(|event| {
        matches!(
            event.kind,
            EventKind::AssistantMessage {
                is_summary: true,
                ..
            }
        )
    }) else {
        return 0;
    };
    events[..summary]
        .iter()
        .rposition(|event| matches!(event.kind, EventKind::UserCompaction { .. }))
        .filter(|opening| {
            // The opening marker must belong to this summary, not an earlier one.
            !events[*opening..summary].iter().any(|event| {
                matches!(
                    event.kind,
                    EventKind::AssistantMessage {
                        is_summary: true,
                        ..
                    }
                )
            })
        })
        .unwrap_or(summary)
}

fn render_output(
    output: &Value,
    is_error: bool,
    error_kind: Option<&str>,
    error_message: Option<&str>,
) -> String {
    if is_error {
        let kind = error_kind.unwrap_or("execution");
        let message = error_message
            .map(str::to_owned)
            .unwrap_or_else(|| value_text(output));
        return format!("Error ({kind}): {message}");
    }
    value_text(output)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn result_ids(events: &[EventRecord]) -> HashSet<&str> {
    events
        .iter()
        .filter_map(|event| match &event.kind {
            EventKind::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
            _ => None,
        })
        .collect()
}

fn output_item(event: &EventRecord, compacted: &HashSet<&str>) -> Option<InputItem> {
    let EventKind::ToolResult {
        tool_use_id,
        output,
        is_error,
        error_kind,
        error_message,
    } = &event.kind
    else {
        return None;
    };
    let output = if compacted.contains(tool_use_id.as_str()) {
        PRUNED_PLACEHOLDER.to_owned()
    } else {
        render_output(
            output,
            *is_error,
            error_kind.map(|kind| kind.as_str()),
            error_message.as_deref(),
        )
    };
    Some(InputItem::FunctionCallOutput {
        call_id: tool_use_id.clone(),
        output,
    })
}

/// Full history from the pivot onward.
///
/// Tool calls with no logged result (a cancelled query) get an interrupted
/// placeholder so every call item is paired with an output item.
pub fn render_history(events: &[EventRecord]) -> Vec<InputItem> {
    let compacted = compacted_ids(events);
    let answered = result_ids(events);
    let mut items = Vec::new();

    for event in &events[pivot_index(events)..] {
        match &event.kind {
            EventKind::UserMessage { text, .. } => items.push(InputItem::user(text.clone())),
            EventKind::AssistantMessage { text, .. } if !text.is_empty() => {
                items.push(InputItem::assistant(text.clone()));
            }
            EventKind::UserCompaction { .. } => items.push(InputItem::user(COMPACTION_PROMPT)),
            EventKind::ToolUse {
                tool_use_id,
                name,
                input,
            } => {
                items.push(InputItem::FunctionCall {
                    call_id: tool_use_id.clone(),
                    name: name.clone(),
                    arguments: input.to_string(),
                });
                if !answered.contains(tool_use_id.as_str()) {
                    items.push(InputItem::FunctionCallOutput {
                        call_id: tool_use_id.clone(),
                        output: INTERRUPTED_OUTPUT.to_owned(),
                    });
                }
            }
            EventKind::ToolResult { .. } => items.extend(output_item(event, &compacted)),
            _ => {}
        }
    }
    items
}

/// Only what a reply-threaded call needs after `anchor`: user turns and tool
/// outputs. The provider already holds everything up to its response.
pub fn render_since(events: &[EventRecord], anchor: SeqNo) -> Vec<InputItem> {
    let compacted = compacted_ids(events);
    let answered = result_ids(events);
    let mut items = Vec::new();

    for event in events.iter().filter(|event| event.seq > anchor) {
        match &event.kind {
            EventKind::UserMessage { text, .. } => items.push(InputItem::user(text.clone())),
            EventKind::ToolUse { tool_use_id, .. } if !answered.contains(tool_use_id.as_str()) => {
                items.push(InputItem::FunctionCallOutput {
                    call_id: tool_use_id.clone(),
                    output: INTERRUPTED_OUTPUT.to_owned(),
                });
            }
            EventKind::ToolResult { .. } => items.extend(output_item(event, &compacted)),
            _ => {}
        }
    }
    items
}
