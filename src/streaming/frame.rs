//! Server-sent-event frame decoding
//!
//! Frames are separated by a blank line. Each frame carries at most one
//! `event:` line and any number of `data:` lines; data lines are joined with
//! `\n` and parsed as JSON, falling back to the raw string.
//!
//! The decoder buffers raw bytes and only decodes complete frames, so a
//! multi-byte UTF-8 sequence split across two network chunks still decodes
//! correctly.

use serde_json::Value;

/// Event name used when a frame has no `event:` line
pub const DEFAULT_EVENT_NAME: &str = "message";

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub event: String,
    /// Parsed JSON, the raw string if it was not JSON, `Null` if empty
    pub data: Value,
}

impl StreamEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Parse a line into (field, value). A single leading space in the value is
/// stripped.
fn parse_field(line: &str) -> Option<(&str, &str)> {
    let colon_pos = line.find(':')?;
    let field = &line[..colon_pos];
    let value = &line[colon_pos + 1..];
    Some((field, value.strip_prefix(' ').unwrap_or(value)))
}

fn parse_data(joined: String) -> Value {
    if joined.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(&joined).unwrap_or(Value::String(joined))
}

/// Decode the text of one complete frame (without its blank-line delimiter).
///
/// Returns `None` for frames that carry no `event:` or `data:` field, such as
/// comment-only keep-alives.
pub fn parse_frame(text: &str) -> Option<StreamEvent> {
    let mut event: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();
    let mut saw_field = false;

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        match parse_field(line) {
            Some(("event", value)) => {
                event = Some(value.to_string());
                saw_field = true;
            }
            Some(("data", value)) => {
                data_lines.push(value);
                saw_field = true;
            }
            // id, retry and unknown fields are ignored
            _ => {}
        }
    }

    if !saw_field {
        return None;
    }

    let event = event
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_EVENT_NAME.to_string());

    Some(StreamEvent {
        event,
        data: parse_data(data_lines.join("\n")),
    })
}

/// Find the first blank line at or after `from`. Returns (end of frame text,
/// bytes consumed).
fn find_boundary(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    for (i, &byte) in buf.iter().enumerate().skip(from) {
        if byte != b'\n' {
            continue;
        }
        let rest = &buf[i + 1..];
        if rest.starts_with(b"\n") {
            return Some((i, i + 2));
        }
        if rest.starts_with(b"\r\n") {
            return Some((i, i + 3));
        }
    }
    None
}

/// Incremental frame decoder. Feed body chunks with [`SseFrameDecoder::push`].
#[derive(Debug, Default)]
pub struct SseFrameDecoder {
    buffer: Vec<u8>,
    // Bytes before this offset hold no complete delimiter
    scan_from: usize,
    frames_decoded: u64,
}

impl SseFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk of body bytes, returning every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        // A delimiter is at most 3 bytes, so its start can sit 2 bytes back
        let mut from = self.scan_from.saturating_sub(2);
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some((frame_end, consumed)) = find_boundary(&self.buffer, from) {
            from = 0;
            let frame: Vec<u8> = self.buffer.drain(..consumed).take(frame_end).collect();
            let text = String::from_utf8_lossy(&frame);
            if let Some(event) = parse_frame(&text) {
                self.frames_decoded += 1;
                events.push(event);
            }
        }

        self.scan_from = self.buffer.len();
        events
    }

    /// End of stream. An incomplete trailing frame is dropped; returns how
    /// many bytes were discarded.
    pub fn finish(&mut self) -> usize {
        let leftover = self.buffer.len();
        if leftover > 0 && !self.buffer.iter().all(|b| b.is_ascii_whitespace()) {
            log::debug!(
                "SseFrameDecoder: discarding {} bytes of incomplete frame",
                leftover
            );
        }
        self.buffer.clear();
        self.scan_from = 0;
        leftover
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}
