// src/buffer_store.rs
//
// Per-session in-memory stores.
// Bounded FIFOs hold decoded rows and terminal lines; header labels, channel
// colours and the latest fast frame are plain overwrite slots.
// Nothing here is persisted; a session's stores die with the session.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::decode::FastFrameResult;

pub const DEFAULT_ROW_CAPACITY: usize = 1000;
pub const DEFAULT_TERMINAL_CAPACITY: usize = 200;

// ============================================================================
// Rolling Buffer
// ============================================================================

/// Fixed-capacity FIFO; pushing past capacity evicts the oldest entry
#[derive(Clone, Debug)]
pub struct RollingBuffer<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> RollingBuffer<T> {
    /// A zero capacity is treated as one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, entry: T) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Most recently pushed entry
    pub fn latest(&self) -> Option<&T> {
        self.entries.back()
    }

    /// All entries, oldest first
    pub fn all(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }

    /// The `max` most recent entries, oldest first
    pub fn tail(&self, max: usize) -> Vec<T> {
        let skip = self.entries.len().saturating_sub(max);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ============================================================================
// Session Buffers
// ============================================================================

/// Snapshot of a session's buffer sizes, for diagnostics
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferStats {
    pub rows: usize,
    pub terminal_lines: usize,
    pub headers: usize,
    pub colors: usize,
    pub has_fast_frame: bool,
}

/// Everything a session exposes to consumers
#[derive(Debug)]
pub struct SessionBuffers {
    rows: RollingBuffer<Vec<f64>>,
    terminal: RollingBuffer<String>,
    headers: Vec<String>,
    colors: Vec<String>,
    fast_frame: Option<FastFrameResult>,
}

impl Default for SessionBuffers {
    fn default() -> Self {
        Self::new(DEFAULT_ROW_CAPACITY, DEFAULT_TERMINAL_CAPACITY)
    }
}

impl SessionBuffers {
    pub fn new(row_capacity: usize, terminal_capacity: usize) -> Self {
        Self {
            rows: RollingBuffer::new(row_capacity),
            terminal: RollingBuffer::new(terminal_capacity),
            headers: Vec::new(),
            colors: Vec::new(),
            fast_frame: None,
        }
    }

    /// Store a decoded row. Rows without any value are not stored.
    pub fn push_row(&mut self, row: Vec<f64>) -> bool {
        if row.is_empty() {
            return false;
        }
        self.rows.push(row);
        true
    }

    /// Latest decoded row, empty if none yet
    pub fn latest_row(&self) -> Vec<f64> {
        self.rows.latest().cloned().unwrap_or_default()
    }

    pub fn rows(&self) -> &RollingBuffer<Vec<f64>> {
        &self.rows
    }

    pub fn push_terminal_line(&mut self, line: String) {
        self.terminal.push(line);
    }

    /// At most `max` most recent terminal lines, oldest first.
    /// Never more than the terminal capacity.
    pub fn terminal_lines(&self, max: usize) -> Vec<String> {
        self.terminal.tail(max.min(self.terminal.capacity()))
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn set_headers(&mut self, headers: Vec<String>) {
        self.headers = headers;
    }

    pub fn colors(&self) -> &[String] {
        &self.colors
    }

    pub fn set_colors(&mut self, colors: Vec<String>) {
        self.colors = colors;
    }

    /// Latest fast frame, or the empty result
    pub fn fast_frame(&self) -> FastFrameResult {
        self.fast_frame.clone().unwrap_or_default()
    }

    /// Replace the stored fast frame; its labels become the session headers
    pub fn set_fast_frame(&mut self, frame: FastFrameResult) {
        if !frame.headers.is_empty() {
            self.headers = frame.headers.clone();
        }
        self.fast_frame = Some(frame);
    }

    /// Clear every store without touching the session itself
    pub fn flush(&mut self) {
        self.rows.clear();
        self.terminal.clear();
        self.headers.clear();
        self.colors.clear();
        self.fast_frame = None;
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            rows: self.rows.len(),
            terminal_lines: self.terminal.len(),
            headers: self.headers.len(),
            colors: self.colors.len(),
            has_fast_frame: self.fast_frame.is_some(),
        }
    }
}
