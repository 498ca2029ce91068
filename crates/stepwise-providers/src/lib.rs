//! Provider streaming protocol adapters.
//!
//! Each wire protocol provides the same three pieces: a pure request body
//! mapping from universal items, a non-streaming response parser, and a
//! [`StreamDecoder`] state machine fed by the shared [`sse::SseFramer`].
//! [`HttpProvider`] wires one protocol to a reqwest transport.

mod accumulate;
pub mod anthropic;
pub mod chat_completions;
pub mod http;
pub mod responses;
pub mod sse;

use serde_json::Value;
use stepwise_protocol::{ModelOutput, ModelRequest, ProviderError, StreamEvent, WireProtocol};

pub use anthropic::AnthropicDecoder;
pub use chat_completions::ChatCompletionsDecoder;
pub use http::{HttpProvider, ProviderConfig, parse_retry_after};
pub use responses::ResponsesDecoder;
pub use sse::{SseEvent, SseFramer};

/// Folds SSE records into stream events for one call.
pub trait StreamDecoder: Send {
    fn decode(&mut self, event: &SseEvent) -> Vec<StreamEvent>;

    /// `true` once a completion or failure has been emitted.
    fn is_finished(&self) -> bool;

    /// Name of the protocol's completion marker, used in failure messages.
    fn terminal_marker(&self) -> &'static str;
}

pub fn build_body(protocol: WireProtocol, request: &ModelRequest, stream: bool) -> Value {
    match protocol {
        WireProtocol::Responses => responses::build_body(request, stream),
        WireProtocol::ChatCompletions => chat_completions::build_body(request, stream),
        WireProtocol::AnthropicMessages => anthropic::build_body(request, stream),
    }
}

pub fn parse_response(protocol: WireProtocol, value: &Value) -> Result<ModelOutput, ProviderError> {
    match protocol {
        WireProtocol::Responses => responses::parse_response(value),
        WireProtocol::ChatCompletions => chat_completions::parse_response(value),
        WireProtocol::AnthropicMessages => anthropic::parse_response(value),
    }
}

pub fn new_decoder(protocol: WireProtocol) -> Box<dyn StreamDecoder> {
    match protocol {
        WireProtocol::Responses => Box::new(ResponsesDecoder::new()),
        WireProtocol::ChatCompletions => Box::new(ChatCompletionsDecoder::new()),
        WireProtocol::AnthropicMessages => Box::new(AnthropicDecoder::new()),
    }
}

/// Framer plus decoder for one streaming call.
pub struct StreamState {
    framer: SseFramer,
    decoder: Box<dyn StreamDecoder>,
}

impl StreamState {
    pub fn new(decoder: Box<dyn StreamDecoder>) -> Self {
        Self {
            framer: SseFramer::new(),
            decoder,
        }
    }

    /// Feed one network chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        for record in self.framer.feed(chunk) {
            if self.decoder.is_finished() {
                break;
            }
            out.extend(self.decoder.decode(&record));
        }
        out
    }

    pub fn is_finished(&self) -> bool {
        self.decoder.is_finished()
    }

    /// End of input. A decoder that never saw its terminal marker yields
    /// `Failed` rather than an empty completion.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if !self.decoder.is_finished()
            && let Some(record) = self.framer.finish()
        {
            out.extend(self.decoder.decode(&record));
        }
        if !self.decoder.is_finished() {
            out.push(StreamEvent::Failed(format!(
                "stream ended before {}",
                self.decoder.terminal_marker()
            )));
        }
        out
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Run `bytes` through a fresh stream state in `chunk_size` pieces.
    pub(crate) fn decode_bytes(
        decoder: Box<dyn StreamDecoder>,
        bytes: &[u8],
        chunk_size: usize,
    ) -> Vec<StreamEvent> {
        let mut state = StreamState::new(decoder);
        let mut out = Vec::new();
        for chunk in bytes.chunks(chunk_size.max(1)) {
            out.extend(state.push(chunk));
            if state.is_finished() {
                return out;
            }
        }
        out.extend(state.finish());
        out
    }

    #[test]
    fn empty_stream_fails_for_every_protocol() {
        for protocol in [
            WireProtocol::Responses,
            WireProtocol::ChatCompletions,
            WireProtocol::AnthropicMessages,
        ] {
            let events = decode_bytes(new_decoder(protocol), b"", 1);
            assert!(
                matches!(events.as_slice(), [StreamEvent::Failed(_)]),
                "{protocol}: {events:?}"
            );
        }
    }

    #[test]
    fn events_after_completion_are_ignored() {
        let stream = "data: [DONE]\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\n";
        let events = decode_bytes(
            new_decoder(WireProtocol::ChatCompletions),
            stream.as_bytes(),
            stream.len(),
        );
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Completed(_)));
    }
}
