//! Data model for the claude CLI's `--output-format stream-json` protocol.
//!
//! Output is a sequence of newline-delimited JSON records, each tagged with a
//! `type`. The reader buffers until a full line is available; an unparseable
//! line is logged and skipped, never fatal to the turn.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

// ─── Stream-json record types ─────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Startup record, carries claude's own session id.
    System {
        subtype: Option<String>,
        session_id: Option<String>,
    },
    /// Incremental assistant output (text and tool-use blocks).
    Assistant { message: AssistantMessage },
    /// Tool output echoed back through the stream.
    User { message: Value },
    /// Terminal record for the turn: final answer plus the session id used
    /// as the continuation token for the next invocation.
    Result {
        subtype: Option<String>,
        result: Option<String>,
        session_id: Option<String>,
        is_error: Option<bool>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { name: String, input: Value },
    #[serde(other)]
    Other,
}

impl AssistantMessage {
    /// Concatenated text of all text blocks in this message.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Names of tool-use blocks in this message, in order.
    pub fn tool_names(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Parse one complete line from the subprocess stream.
/// Returns None for records we cannot decode; the event loop keeps going.
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    if line.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(ev) => Some(ev),
        Err(_) => {
            warn!(line, "unparseable stream-json record");
            None
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
