use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stepwise_compaction::CompactionOptions;

/// Backoff for provider rate limits. Other provider errors are not retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based). A provider hint is
    /// used as given; otherwise the initial delay doubles up to the cap.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint;
        }
        let factor = 1_u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let millis = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub model: String,
    /// System instructions sent with every model call.
    pub instructions: Option<String>,
    pub max_steps: u32,
    pub cwd: PathBuf,
    /// Stream when the provider supports it.
    pub stream: bool,
    pub max_output_tokens: Option<u32>,
    /// Tool name patterns the model may call. `None` allows every tool.
    pub allowed_tools: Option<Vec<String>>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub compaction: CompactionOptions,
    pub retry: RetryPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4.1-mini".to_owned(),
            instructions: None,
            max_steps: 32,
            cwd: PathBuf::from("."),
            stream: true,
            max_output_tokens: None,
            allowed_tools: None,
            api_key: None,
            compaction: CompactionOptions::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay_ms: 250,
            max_delay_ms: 1_500,
        };
        let delays: Vec<_> = (0..5)
            .map(|attempt| policy.delay_for(attempt, None).as_millis())
            .collect();
        assert_eq!(delays, [250, 500, 1_000, 1_500, 1_500]);
        assert_eq!(policy.delay_for(63, None), Duration::from_millis(1_500));
        assert_eq!(policy.delay_for(80, None), Duration::from_millis(1_500));
    }

    #[test]
    fn retry_after_hint_wins() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for(2, Some(Duration::from_millis(1_000))),
            Duration::from_millis(1_000)
        );
    }

    #[test]
    fn config_fills_defaults_from_partial_json() {
        let config: RuntimeConfig = serde_json::from_str(
            r#"{"model":"claude-sonnet","max_steps":4,"compaction":{"context_limit":0}}"#,
        )
        .unwrap();
        assert_eq!(config.model, "claude-sonnet");
        assert_eq!(config.max_steps, 4);
        assert!(config.stream);
        assert_eq!(config.compaction.context_limit, 0);
        assert_eq!(config.compaction.reserved, 32_000);
        assert_eq!(config.retry, RetryPolicy::default());
    }
}
