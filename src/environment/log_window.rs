//! Fixed-capacity rolling window over provisioning log lines.
//!
//! Container provisioning can produce unbounded output over many minutes;
//! the window keeps only the most recent `capacity` lines, in order, so
//! memory use and rendered message size stay bounded regardless of how long
//! the build runs. Shared by the primary and fallback container flows.

use std::collections::VecDeque;

pub struct LogWindow {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a line, evicting the oldest once at capacity.
    /// Blank lines are skipped.
    pub fn push(&mut self, line: &str) {
        let line = line.trim_end();
        if line.trim().is_empty() {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The whole window joined with newlines, oldest first.
    pub fn render(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// The most recent `n` lines joined with newlines.
    pub fn tail(&self, n: usize) -> String {
        let skip = self.lines.len().saturating_sub(n);
        self.lines
            .iter()
            .skip(skip)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
