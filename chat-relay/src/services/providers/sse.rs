//! Incremental decoder for the `text/event-stream` body returned by
//! `streamGenerateContent?alt=sse`.
//!
//! Network chunks do not respect event boundaries, so bytes are buffered until
//! a blank line closes an event. Decoding to UTF-8 happens per event, which
//! keeps multi-byte characters that straddle two chunks intact.

/// Buffers raw bytes and yields the `data` payload of each complete event.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a network chunk; returns payloads of the events it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        // CR only ever appears as part of a line ending; JSON escapes it.
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut payloads = Vec::new();
        while let Some(end) = find_event_end(&self.buffer) {
            let event: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(data) = event_data(&event[..end]) {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Flush a trailing event the upstream closed without a blank line.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        event_data(&rest)
    }
}

fn find_event_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

/// Join the `data:` lines of one event. Comments and other fields are ignored.
fn event_data(event: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(event);
    let lines: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect();

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}
