//! Pure parsing of a session log's bytes.
//!
//! Sequence numbers and the repair point are derived from the stored lines
//! alone, so any number of store instances reading the same file agree on
//! the next `seq`.

use stepwise_protocol::{EventRecord, SeqNo};

use crate::StoreError;

/// Result of scanning a log file.
#[derive(Debug, Clone, PartialEq)]
pub struct LogScan {
    pub events: Vec<EventRecord>,
    /// Byte length of the valid prefix. Anything after it is a torn tail.
    pub valid_len: u64,
    pub total_len: u64,
    pub last_seq: SeqNo,
}

impl LogScan {
    pub fn needs_repair(&self) -> bool {
        self.valid_len < self.total_len
    }

    pub fn next_seq(&self) -> SeqNo {
        self.last_seq + 1
    }
}

struct Line<'a> {
    index: usize,
    end: usize,
    text: &'a [u8],
    terminated: bool,
}

fn split_lines(bytes: &[u8]) -> Vec<Line<'_>> {
    let mut lines = Vec::new();
    let mut start = 0;
    while start < bytes.len() {
        let (end, terminated) = match bytes[start..].iter().position(|b| *b == b'\n') {
            Some(offset) => (start + offset + 1, true),
            None => (bytes.len(), false),
        };
        let text_end = if terminated { end - 1 } else { end };
        lines.push(Line {
            index: lines.len(),
            end,
            text: &bytes[start..text_end],
            terminated,
        });
        start = end;
    }
    lines
}

/// Scan a whole log.
///
/// An unterminated final segment, or a terminated final line that does not
/// parse, is treated as a torn write: it is excluded from `events` and from
/// `valid_len`. A bad line anywhere else is `StoreError::CorruptLine`.
pub fn scan_log(session_id: &str, bytes: &[u8]) -> Result<LogScan, StoreError> {
    let lines = split_lines(bytes);
    let last_index = lines.len().checked_sub(1);
    let mut events = Vec::with_capacity(lines.len());
    let mut valid_len = 0_u64;
    let mut last_seq: SeqNo = 0;

    for line in &lines {
        let is_last = Some(line.index) == last_index;
        if !line.terminated {
            // Only the final segment can be unterminated.
            break;
        }
        if line.text.iter().all(u8::is_ascii_whitespace) {
            valid_len = line.end as u64;
            continue;
        }
        let parsed = serde_json::from_slice::<EventRecord>(line.text)
            .map_err(|err| err.to_string())
            .and_then(|record| {
                if record.seq <= last_seq {
                    Err(format!(
                        "sequence {} does not follow {}",
                        record.seq, last_seq
                    ))
                } else {
                    Ok(record)
                }
            });
        match parsed {
            Ok(record) => {
                last_seq = record.seq;
                events.push(record);
                valid_len = line.end as u64;
            }
            Err(_) if is_last => break,
            Err(reason) => {
                return Err(StoreError::CorruptLine {
                    session_id: session_id.to_owned(),
                    line_index: line.index,
                    reason,
                });
            }
        }
    }

    Ok(LogScan {
        events,
        valid_len,
        total_len: bytes.len() as u64,
        last_seq,
    })
}
