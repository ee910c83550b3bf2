//! Event channel line framing.
//!
//! The server's change stream is newline-delimited: meaningful events are
//! `data:` lines, comment/heartbeat lines begin with `:`, and blank lines
//! delimit events. Everything else is ignored.

use std::time::Duration;

/// Fixed delay before reconnecting a dropped event channel.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Classification of one stream line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventLine {
    /// Change notification payload.
    Data(String),
    /// Comment/heartbeat line.
    Heartbeat,
    /// Blank line between events.
    Delimiter,
    /// Unrecognized content.
    Other,
}

/// Classify a single line (without its trailing newline).
#[must_use]
pub fn classify_line(line: &str) -> EventLine {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.is_empty() {
        return EventLine::Delimiter;
    }
    if let Some(payload) = line.strip_prefix("data:") {
        return EventLine::Data(payload.trim_start().to_string());
    }
    if line.starts_with(':') {
        return EventLine::Heartbeat;
    }
    EventLine::Other
}

/// Accumulates stream chunks and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a received chunk.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pop the next complete line, newline excluded.
    pub fn next_line(&mut self) -> Option<String> {
        let newline = self.buffer.iter().position(|&byte| byte == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=newline).take(newline).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}
