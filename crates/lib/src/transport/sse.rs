//! Incremental `text/event-stream` decoder.
//!
//! Bytes go in as they arrive from the network; complete frames (the joined
//! `data` lines of one event) come out. Chunk boundaries may fall anywhere,
//! including inside a line.

/// Splits a server-sent-event byte stream into frame payloads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk; returns the frames it completed, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(i) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=i).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');
            if let Some(frame) = self.process_line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn process_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            let frame = self.data.join("\n");
            self.data.clear();
            return Some(frame);
        }
        // comment / keep-alive
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        // event/id/retry carry nothing this client uses; the payload names its own type.
        if field == "data" {
            self.data.push(value.to_string());
        }
        None
    }
}
