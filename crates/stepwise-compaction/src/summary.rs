//! The summarization pass: one extra non-streaming call with no tools and
//! no reply threading.

use stepwise_protocol::{InputItem, ModelProvider, ModelRequest, ProviderError, Role, Usage};
use tracing::{debug, instrument};

pub const SUMMARY_INSTRUCTION: &str = "You are summarizing a conversation between a user and a \
coding agent so the agent can continue without the full history. Preserve what was asked, \
what has been done, which files and tools were involved, key results and decisions, and \
what remains to be done. Be factual and concise.";

/// Synthetic user turn appended after a summary.
pub const CONTINUE_PROMPT: &str = "Continue if you have next steps, or stop and ask for \
clarification if you are unsure how to proceed.";

/// Longest rendering of a single item in the transcript.
const MAX_ITEM_CHARS: usize = 2_000;

fn clip(text: &str) -> String {
    if text.chars().count() <= MAX_ITEM_CHARS {
        return text.to_owned();
    }
    let head: String = text.chars().take(MAX_ITEM_CHARS).collect();
    format!("{head} [...]")
}

/// Render items as a plain-text transcript.
pub fn transcript(items: &[InputItem]) -> String {
    let mut buf = String::with_capacity(items.len() * 200);
    for item in items {
        match item {
            InputItem::Message { role, content } => {
                let label = match role {
                    Role::System => "System",
                    Role::User => "User",
                    Role::Assistant => "Assistant",
                };
                buf.push_str(label);
                buf.push_str(": ");
                buf.push_str(&clip(content));
            }
            InputItem::FunctionCall {
                name, arguments, ..
            } => {
                buf.push_str(&format!("[tool_call: {name}({})]", clip(arguments)));
            }
            InputItem::FunctionCallOutput { output, .. } => {
                buf.push_str("Tool: ");
                buf.push_str(&clip(output));
            }
        }
        buf.push('\n');
    }
    buf
}

/// Build the summarization request from rendered history.
pub fn summary_request(model: &str, items: &[InputItem], instruction: &str) -> ModelRequest {
    let mut request = ModelRequest::new(model, vec![InputItem::user(transcript(items))]);
    request.instructions = Some(instruction.to_owned());
    request
}

/// Text and usage of a summarization call.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub text: String,
    pub usage: Option<Usage>,
}

/// Run the summarization call. An empty summary is an invalid response.
#[instrument(skip_all, fields(provider = provider.name(), model = %request.model))]
pub async fn summarize(
    provider: &dyn ModelProvider,
    mut request: ModelRequest,
) -> Result<Summary, ProviderError> {
    request.tools.clear();
    request.previous_response_id = None;
    let output = provider.complete(request).await?;
    let text = output.text_or_empty().trim();
    if text.is_empty() {
        return Err(ProviderError::invalid_response("summarization returned no text"));
    }
    debug!(summary_len = text.len(), "received conversation summary");
    Ok(Summary {
        text: text.to_owned(),
        usage: output.usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use stepwise_protocol::ModelOutput;

    struct Recorder {
        reply: String,
        seen: Mutex<Vec<ModelRequest>>,
    }

    #[async_trait]
    impl ModelProvider for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn complete(&self, request: ModelRequest) -> Result<ModelOutput, ProviderError> {
            self.seen.lock().push(request);
            Ok(ModelOutput::text(self.reply.clone()))
        }
    }

    #[test]
    fn transcript_labels_roles_and_tools() {
        let items = vec![
            InputItem::user("read a.txt"),
            InputItem::FunctionCall {
                call_id: "c1".into(),
                name: "read".into(),
                arguments: "{\"path\":\"a.txt\"}".into(),
            },
            InputItem::FunctionCallOutput {
                call_id: "c1".into(),
                output: "hello".into(),
            },
            InputItem::assistant("it says hello"),
        ];
        let text = transcript(&items);
        assert_eq!(
            text,
            "User: read a.txt\n[tool_call: read({\"path\":\"a.txt\"})]\nTool: hello\nAssistant: it says hello\n"
        );
    }

    #[test]
    fn long_items_are_clipped() {
        let items = vec![InputItem::user("x".repeat(5_000))];
        let text = transcript(&items);
        assert!(text.len() < 2_100);
        assert!(text.contains("[...]"));
    }

    #[tokio::test]
    async fn summarize_sends_one_plain_request() {
        let provider = Recorder {
            reply: "  the summary  ".into(),
            seen: Mutex::new(Vec::new()),
        };
        let request = summary_request("m1", &[InputItem::user("hi")], SUMMARY_INSTRUCTION);
        let summary = summarize(&provider, request).await.unwrap();
        assert_eq!(summary.text, "the summary");

        let seen = provider.seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].tools.is_empty());
        assert_eq!(seen[0].items.len(), 1);
        assert_eq!(seen[0].instructions.as_deref(), Some(SUMMARY_INSTRUCTION));
    }

    #[tokio::test]
    async fn empty_summary_is_rejected() {
        let provider = Recorder {
            reply: "   ".into(),
            seen: Mutex::new(Vec::new()),
        };
        let request = summary_request("m1", &[], SUMMARY_INSTRUCTION);
        let err = summarize(&provider, request).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_response");
    }
}
