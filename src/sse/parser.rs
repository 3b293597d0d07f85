//! SSE wire decoding and payload parsing.
//!
//! Payload parsers never fail: malformed data degrades to an empty list or
//! the default heartbeat timeout.

use serde_json::Value;
use tracing::{debug, warn};

use crate::model::{InboxMessage, InboxMessageResponse, Message};

pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: i64 = 30_000;

/// One dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event_type: Option<String>,
    pub data: String,
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Bytes may be fed in arbitrary chunks; frames are returned once their
/// terminating blank line arrives.
#[derive(Debug, Default)]
pub struct SseFrameDecoder {
    buffer: Vec<u8>,
    event_type: Option<String>,
    data_lines: Vec<String>,
}

impl SseFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
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
            "event" => self.event_type = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            "id" | "retry" => {}
            other => debug!(field = other, "ignoring unknown sse field"),
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event_type = self.event_type.take();
        if self.data_lines.is_empty() && event_type.is_none() {
            return None;
        }
        let data = std::mem::take(&mut self.data_lines).join("\n");
        Some(SseFrame { event_type, data })
    }
}

/// Parses a `messages` payload.
pub fn parse_messages(data: &str) -> Vec<Message> {
    if data.trim().is_empty() {
        debug!("received empty message data");
        return Vec::new();
    }

    serde_json::from_str(data).unwrap_or_else(|e| {
        warn!(error = %e, data, "failed to parse messages payload");
        Vec::new()
    })
}

/// Parses an `inbox_messages` payload, dropping entries without a queue id
/// or send time.
pub fn parse_inbox_messages(data: &str) -> Vec<InboxMessage> {
    if data.trim().is_empty() {
        debug!("received empty inbox data");
        return Vec::new();
    }

    let entries: Vec<InboxMessageResponse> = match serde_json::from_str(data) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, data, "failed to parse inbox payload");
            return Vec::new();
        }
    };
    let total = entries.len();
    let messages: Vec<InboxMessage> = entries
        .into_iter()
        .filter_map(InboxMessage::from_response)
        .collect();
    if messages.len() < total {
        debug!(count = total - messages.len(), "filtered out invalid inbox messages");
    }
    messages
}

/// Parses `{"heartbeat": <seconds>}` into milliseconds.
pub fn parse_heartbeat_timeout_ms(data: &str) -> i64 {
    if data.trim().is_empty() {
        debug!("heartbeat without data, using default timeout");
        return DEFAULT_HEARTBEAT_TIMEOUT_MS;
    }

    let seconds = match serde_json::from_str::<Value>(data) {
        Ok(value) => value.get("heartbeat").and_then(|v| {
            v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))
        }),
        Err(e) => {
            warn!(error = %e, data, "failed to parse heartbeat payload");
            None
        }
    };

    seconds.map_or(DEFAULT_HEARTBEAT_TIMEOUT_MS, |s| s.saturating_mul(1000))
}
