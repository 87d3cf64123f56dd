//! Rate-limited coalescing of streamed assistant text into progress updates.
//!
//! The subprocess can emit many small records per second; forwarding each one
//! to the chat interface would flood it. The coalescer batches pending text
//! and releases it at most once per interval. It is a pure function of
//! (last emit time, now, pending buffer) so it can be tested without I/O.
//! The final flush at end of turn is unconditional: the last event of a turn
//! is never silently dropped.

use std::time::{Duration, Instant};

pub struct Coalescer {
    interval: Duration,
    last_emit: Option<Instant>,
    pending: String,
}

impl Coalescer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            pending: String::new(),
        }
    }

    /// Add text to the pending buffer. Returns the accumulated text when the
    /// rate limit allows an emission, None when it should stay batched.
    pub fn push(&mut self, now: Instant, text: &str) -> Option<String> {
        if !self.pending.is_empty() {
            self.pending.push('\n');
        }
        self.pending.push_str(text);
        let due = match self.last_emit {
            None => true,
            Some(prev) => now.duration_since(prev) >= self.interval,
        };
        if due {
            self.last_emit = Some(now);
            Some(std::mem::take(&mut self.pending))
        } else {
            None
        }
    }

    /// Unconditionally drain whatever is pending. Called once at end of turn.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    /// Drop pending text without emitting (failed turn; only the error
    /// summary is surfaced).
    pub fn discard(&mut self) {
        self.pending.clear();
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
