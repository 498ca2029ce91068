//! Line-oriented Server-Sent-Events framer.
//!
//! Bytes are buffered until a full line is available, so network reads may
//! split anywhere (including inside a multi-byte UTF-8 sequence). `event:`
//! and `data:` fields accumulate until a blank line dispatches the record.

/// One dispatched SSE record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field, if any.
    pub event: Option<String>,
    /// All `data:` lines joined with `\n`.
    pub data: String,
}

impl SseEvent {
    pub fn is_done_marker(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

#[derive(Debug, Default)]
pub struct SseFramer {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every record completed by them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.push_line(&line) {
                out.push(event);
            }
        }
        out
    }

    /// Flush at end of stream: an unterminated last line and any pending
    /// fields are dispatched as a final record.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).into_owned();
            let line = line.strip_suffix('\r').unwrap_or(&line).to_owned();
            if let Some(event) = self.push_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn push_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_owned()),
            "data" => self.data.push(value.to_owned()),
            _ => tracing::trace!(field, "ignoring SSE field"),
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: self.event.take(),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "event: message_start\ndata: {\"a\":1}\n\n: keep-alive\n\ndata: first\ndata: second\n\ndata: [DONE]\n\n";

    fn feed_all(chunks: &[&[u8]]) -> Vec<SseEvent> {
        let mut framer = SseFramer::new();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(framer.feed(chunk));
        }
        out.extend(framer.finish());
        out
    }

    #[test]
    fn frames_events_and_multiline_data() {
        let events = feed_all(&[STREAM.as_bytes()]);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[1].event, None);
        assert_eq!(events[1].data, "first\nsecond");
        assert!(events[2].is_done_marker());
    }

    #[test]
    fn byte_by_byte_feeding_matches_whole_feeding() {
        let bytes = STREAM.as_bytes();
        let chunks: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(feed_all(&chunks), feed_all(&[bytes]));
    }

    #[test]
    fn split_inside_utf8_sequence_is_reassembled() {
        let text = "data: héllo ✓\n\n";
        let bytes = text.as_bytes();
        // Split inside the three-byte check mark.
        let cut = bytes.len() - 4;
        let events = feed_all(&[&bytes[..cut], &bytes[cut..]]);
        assert_eq!(events[0].data, "héllo ✓");
    }

    #[test]
    fn crlf_line_endings_are_accepted() {
        let events = feed_all(&[b"event: ping\r\ndata: {}\r\n\r\n"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("ping"));
        assert_eq!(events[0].data, "{}");
    }

    #[test]
    fn finish_flushes_unterminated_record() {
        let events = feed_all(&[b"data: tail"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }
}
