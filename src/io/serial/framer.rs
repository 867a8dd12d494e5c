// src/io/serial/framer.rs
//
// Line framing for serial streams.
// Splits an append-only byte stream on a configurable end-of-line token and
// carries the trailing partial line over to the next chunk.

/// Default upper bound for a single line before a forced split
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// A complete line extracted from the serial stream
#[derive(Debug, Clone, PartialEq)]
pub struct SerialLine {
    /// Line text without the end-of-line token (lossy UTF-8)
    pub text: String,
    /// Whether this line came from flush() and may be incomplete
    pub incomplete: bool,
}

/// Stateful end-of-line framer.
///
/// Feeding the same byte stream in any chunking yields the same lines in the
/// same order: matching is done per byte against the tail of the carry buffer,
/// so a token split across two reads is still recognised.
pub struct LineFramer {
    buffer: Vec<u8>,
    delimiter: Vec<u8>,
    max_length: usize,
}

impl LineFramer {
    /// Create a framer splitting on `eol`. An empty token falls back to `"\n"`.
    pub fn new(eol: &str) -> Self {
        Self::with_max_length(eol, DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_length(eol: &str, max_length: usize) -> Self {
        let delimiter = if eol.is_empty() {
            b"\n".to_vec()
        } else {
            eol.as_bytes().to_vec()
        };
        LineFramer {
            buffer: Vec::new(),
            delimiter,
            max_length: max_length.max(1),
        }
    }

    /// The end-of-line token this framer splits on
    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    /// Number of carried bytes waiting for an end-of-line token
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// The carried bytes themselves
    pub fn pending_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Feed raw bytes into the framer.
    /// Returns every line completed by this chunk, in stream order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<SerialLine> {
        let mut lines = Vec::new();

        for &byte in data {
            self.buffer.push(byte);

            // Check for delimiter match at end of buffer
            if self.buffer.len() >= self.delimiter.len() {
                let start = self.buffer.len() - self.delimiter.len();
                if self.buffer[start..] == self.delimiter[..] {
                    self.buffer.truncate(start);
                    let line: Vec<u8> = std::mem::take(&mut self.buffer);
                    lines.push(SerialLine {
                        text: String::from_utf8_lossy(&line).into_owned(),
                        incomplete: false,
                    });
                    continue;
                }
            }

            // Force split on max length
            if self.buffer.len() >= self.max_length {
                let line: Vec<u8> = std::mem::take(&mut self.buffer);
                lines.push(SerialLine {
                    text: String::from_utf8_lossy(&line).into_owned(),
                    incomplete: false,
                });
            }
        }

        lines
    }

    /// Flush any remaining buffered data as a line.
    /// Call when the stream ends; the line is marked incomplete.
    pub fn flush(&mut self) -> Option<SerialLine> {
        if self.buffer.is_empty() {
            None
        } else {
            let line: Vec<u8> = std::mem::take(&mut self.buffer);
            Some(SerialLine {
                text: String::from_utf8_lossy(&line).into_owned(),
                incomplete: true,
            })
        }
    }

    /// Drop the carry buffer without emitting it
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
