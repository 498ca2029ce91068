//! Context compaction engine.
//!
//! Pure decisions over a session's events plus reported usage:
//!
//! 1. [`would_overflow`] — has the context window (minus the reserved output
//!    budget) been reached?
//! 2. [`select_tool_outputs_to_prune`] — which old tool outputs can be
//!    replaced with a placeholder?
//! 3. [`history`] — render the log from the latest summary pivot into
//!    provider-agnostic input items, honouring pruning markers.
//! 4. [`summary`] — build and run the one-shot summarization call.
//!
//! Nothing here writes to the log; the runtime persists the decisions.

pub mod history;
pub mod summary;

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepwise_protocol::{EventKind, EventRecord, Usage};
use tracing::debug;

pub use history::{
    COMPACTION_PROMPT, INTERRUPTED_OUTPUT, PRUNED_PLACEHOLDER, compacted_ids, pivot_index,
    render_history, render_since,
};
pub use summary::{
    CONTINUE_PROMPT, SUMMARY_INSTRUCTION, Summary, summarize, summary_request, transcript,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionOptions {
    /// Summarize automatically when usage overflows.
    pub auto: bool,
    /// Replace old tool outputs with a placeholder.
    pub prune: bool,
    /// Model context window in tokens. `0` disables overflow detection.
    pub context_limit: u64,
    /// Output budget kept free below the limit.
    pub reserved: u64,
    /// Overrides `context_limit` for input-side accounting.
    pub input_limit: Option<u64>,
    pub protect_tool_output_tokens: u64,
    pub min_prune_tokens: u64,
    /// User turns (counted from the end) whose tool outputs are never pruned.
    pub min_user_turns: usize,
    /// Tools whose outputs are never pruned.
    pub protected_tools: Vec<String>,
}

impl Default for CompactionOptions {
    fn default() -> Self {
        Self {
            auto: true,
            prune: true,
            context_limit: 200_000,
            reserved: 32_000,
            input_limit: None,
            protect_tool_output_tokens: 40_000,
            min_prune_tokens: 20_000,
            min_user_turns: 2,
            protected_tools: Vec::new(),
        }
    }
}

impl CompactionOptions {
    /// Tokens available before the reserved output budget.
    pub fn usable_tokens(&self) -> u64 {
        let effective = self.input_limit.unwrap_or(self.context_limit);
        effective.saturating_sub(self.reserved)
    }
}

/// Rough token count when no tokenizer is available: a quarter of the
/// character count, never less than one.
pub fn estimate_tokens(text: &str) -> u64 {
    estimate_tokens_for_chars(text.chars().count())
}

pub fn estimate_tokens_for_chars(chars: usize) -> u64 {
    ((chars / 4) as u64).max(1)
}

/// Token estimate of a JSON tool output as it would be rendered.
pub fn estimate_value_tokens(value: &Value) -> u64 {
    match value {
        Value::String(text) => estimate_tokens(text),
        other => estimate_tokens(&other.to_string()),
    }
}

/// Tokens a call occupied, as reported by the provider.
pub fn usage_tokens(usage: &Usage) -> u64 {
    usage.total()
}

/// `true` once `usage_tokens` reaches the usable budget. Reaching it exactly
/// counts as overflow. Always `false` when `context_limit` is zero.
pub fn would_overflow(options: &CompactionOptions, usage_tokens: u64) -> bool {
    if options.context_limit == 0 {
        return false;
    }
    usage_tokens >= options.usable_tokens()
}

/// Pick tool-call ids whose outputs should be marked compacted.
///
/// Walks backward from the end of the log until the latest summary. Tool
/// results inside the most recent `min_user_turns` user turns are skipped.
/// An already-compacted result ends the walk, so older outputs are never
/// reconsidered. Results become candidates once the cumulative estimate
/// exceeds `protect_tool_output_tokens`; the candidates are returned only if
/// together they exceed `min_prune_tokens`.
pub fn select_tool_outputs_to_prune(
    events: &[EventRecord],
    options: &CompactionOptions,
) -> Vec<String> {
    if !options.prune {
        return Vec::new();
    }

    let compacted = compacted_ids(events);
    let tool_names: HashMap<&str, &str> = events
        .iter()
        .filter_map(|event| match &event.kind {
            EventKind::ToolUse {
                tool_use_id, name, ..
            } => Some((tool_use_id.as_str(), name.as_str())),
            _ => None,
        })
        .collect();
    let protected: HashSet<&str> = options.protected_tools.iter().map(String::as_str).collect();

    let mut turns = 0_usize;
    let mut total = 0_u64;
    let mut pruned = 0_u64;
    let mut candidates = Vec::new();

    for event in events.iter().rev() {
        match &event.kind {
            EventKind::UserMessage { .. } => {
                turns += 1;
                continue;
            }
            EventKind::AssistantMessage {
                is_summary: true, ..
            } => break,
            _ => {}
        }
        if turns < options.min_user_turns {
            continue;
        }
        let EventKind::ToolResult {
            tool_use_id,
            output,
            ..
        } = &event.kind
        else {
            continue;
        };
        if tool_names
            .get(tool_use_id.as_str())
            .is_some_and(|name| protected.contains(name))
        {
            continue;
        }
        if compacted.contains(tool_use_id.as_str()) {
            break;
        }
        let estimate = estimate_value_tokens(output);
        total += estimate;
        if total > options.protect_tool_output_tokens {
            pruned += estimate;
            candidates.push(tool_use_id.clone());
        }
    }

    if pruned <= options.min_prune_tokens {
        debug!(
            total,
            pruned,
            candidates = candidates.len(),
            "prune pass below minimum, skipping"
        );
        return Vec::new();
    }

    candidates.reverse();
    debug!(total, pruned, count = candidates.len(), "tool outputs selected for pruning");
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_protocol::EventRecord;

    pub(crate) fn record(seq: u64, kind: EventKind) -> EventRecord {
        EventRecord {
            seq,
            ts: seq as f64,
            kind,
        }
    }

    pub(crate) fn user(text: &str) -> EventKind {
        EventKind::UserMessage {
            text: text.into(),
            synthetic: false,
        }
    }

    pub(crate) fn tool_use(id: &str, name: &str) -> EventKind {
        EventKind::ToolUse {
            tool_use_id: id.into(),
            name: name.into(),
            input: json!({}),
        }
    }

    pub(crate) fn tool_result(id: &str, output: &str) -> EventKind {
        EventKind::ToolResult {
            tool_use_id: id.into(),
            output: Value::String(output.into()),
            is_error: false,
            error_kind: None,
            error_message: None,
        }
    }

    fn small_options() -> CompactionOptions {
        CompactionOptions {
            protect_tool_output_tokens: 100,
            min_prune_tokens: 50,
            ..CompactionOptions::default()
        }
    }

    /// user, (tool_use, tool_result) per output, repeated per turn.
    fn log_with_turns(turns: &[&[usize]]) -> Vec<EventRecord> {
        let mut kinds = Vec::new();
        let mut call = 0;
        for outputs in turns {
            kinds.push(user("go"));
            for chars in *outputs {
                let id = format!("call-{call}");
                call += 1;
                kinds.push(tool_use(&id, "read"));
                kinds.push(tool_result(&id, &"x".repeat(*chars)));
            }
        }
        kinds
            .into_iter()
            .enumerate()
            .map(|(i, kind)| record(i as u64 + 1, kind))
            .collect()
    }

    #[test]
    fn estimate_is_quarter_of_chars_with_floor_of_one() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens(&"a".repeat(400)), 100);
    }

    #[test]
    fn overflow_boundary_is_inclusive() {
        let options = CompactionOptions {
            context_limit: 1_000,
            reserved: 200,
            ..CompactionOptions::default()
        };
        assert!(!would_overflow(&options, 799));
        assert!(would_overflow(&options, 800));
        assert!(would_overflow(&options, 5_000));
    }

    #[test]
    fn overflow_disabled_without_context_limit() {
        let options = CompactionOptions {
            context_limit: 0,
            ..CompactionOptions::default()
        };
        assert!(!would_overflow(&options, u64::MAX));
    }

    #[test]
    fn input_limit_overrides_context_limit() {
        let options = CompactionOptions {
            context_limit: 1_000,
            input_limit: Some(500),
            reserved: 100,
            ..CompactionOptions::default()
        };
        assert!(would_overflow(&options, 400));
    }

    #[test]
    fn nothing_pruned_before_two_user_turns() {
        let events = log_with_turns(&[&[4_000, 4_000, 4_000]]);
        assert!(select_tool_outputs_to_prune(&events, &small_options()).is_empty());
    }

    #[test]
    fn old_outputs_beyond_protection_are_selected() {
        // 1000 tokens each in the first turn; the last two turns are protected.
        let events = log_with_turns(&[&[4_000, 4_000], &[40], &[40]]);
        let selected = select_tool_outputs_to_prune(&events, &small_options());
        assert_eq!(selected, vec!["call-0".to_string(), "call-1".to_string()]);
    }

    #[test]
    fn selection_below_minimum_is_discarded() {
        let options = CompactionOptions {
            protect_tool_output_tokens: 100,
            min_prune_tokens: 10_000,
            ..CompactionOptions::default()
        };
        let events = log_with_turns(&[&[4_000, 4_000], &[40], &[40]]);
        assert!(select_tool_outputs_to_prune(&events, &options).is_empty());
    }

    #[test]
    fn compacted_marker_is_an_idempotence_boundary() {
        let mut events = log_with_turns(&[&[4_000, 4_000], &[40], &[40]]);
        let selected = select_tool_outputs_to_prune(&events, &small_options());
        let mut seq = events.len() as u64;
        for id in &selected {
            seq += 1;
            events.push(record(
                seq,
                EventKind::ToolOutputCompacted {
                    tool_use_id: id.clone(),
                },
            ));
        }
        assert!(select_tool_outputs_to_prune(&events, &small_options()).is_empty());
    }

    #[test]
    fn protected_tools_are_never_selected() {
        let options = CompactionOptions {
            protected_tools: vec!["read".into()],
            ..small_options()
        };
        let events = log_with_turns(&[&[4_000, 4_000], &[40], &[40]]);
        assert!(select_tool_outputs_to_prune(&events, &options).is_empty());
    }

    #[test]
    fn walk_stops_at_summary() {
        let mut events = log_with_turns(&[&[4_000, 4_000]]);
        let mut seq = events.len() as u64;
        seq += 1;
        events.push(record(
            seq,
            EventKind::AssistantMessage {
                text: "summary".into(),
                is_summary: true,
                response_id: None,
            },
        ));
        for kind in [user("a"), user("b")] {
            seq += 1;
            events.push(record(seq, kind));
        }
        assert!(select_tool_outputs_to_prune(&events, &small_options()).is_empty());
    }

    #[test]
    fn prune_disabled_returns_nothing() {
        let options = CompactionOptions {
            prune: false,
            ..small_options()
        };
        let events = log_with_turns(&[&[4_000, 4_000], &[40], &[40]]);
        assert!(select_tool_outputs_to_prune(&events, &options).is_empty());
    }
}
