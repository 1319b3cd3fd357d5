// Decodes Ollama's newline-delimited JSON stream into plain text fragments

use serde_json::Value;

/// Longest line kept while waiting for its terminator.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Incremental NDJSON decoder for `/api/generate` output.
///
/// Bytes are buffered until a `\n` completes a line. A newline byte never
/// appears inside a multi-byte UTF-8 sequence, so decoding whole lines keeps
/// characters intact no matter where the chunk boundaries fall.
///
/// A line that outgrows the limit without a terminator is dropped like any
/// other malformed line, up to and including its eventual `\n`.
#[derive(Debug)]
pub struct NdjsonTranscoder {
    pending: Vec<u8>,
    max_line: usize,
    skipping_line: bool,
}

impl Default for NdjsonTranscoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl NdjsonTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line,
            skipping_line: false,
        }
    }

    /// Buffers `chunk` and returns the fragments of every line it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Fragments {
        let mut chunk = chunk;
        if self.skipping_line {
            match chunk.iter().position(|b| *b == b'\n') {
                Some(end) => {
                    self.skipping_line = false;
                    chunk = &chunk[end + 1..];
                }
                None => return Fragments::default(),
            }
        }

        self.pending.extend_from_slice(chunk);

        let completed = match self.pending.iter().rposition(|b| *b == b'\n') {
            Some(last_newline) => self.pending.drain(..=last_newline).collect(),
            None => Vec::new(),
        };

        if self.pending.len() > self.max_line {
            tracing::debug!(bytes = self.pending.len(), "dropping oversized backend line");
            self.pending = Vec::new();
            self.skipping_line = true;
        }

        Fragments {
            lines: completed,
            cursor: 0,
        }
    }

    /// Bytes waiting for a line terminator.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Ends the stream. An unterminated trailing line is discarded, never
    /// parsed; the number of dropped bytes is returned.
    pub fn close(self) -> usize {
        self.pending.len()
    }
}

/// Lazy iterator over the text fragments of a batch of completed lines.
#[derive(Debug, Default)]
pub struct Fragments {
    lines: Vec<u8>,
    cursor: usize,
}

impl Iterator for Fragments {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        while self.cursor < self.lines.len() {
            let rest = &self.lines[self.cursor..];
            let end = rest
                .iter()
                .position(|b| *b == b'\n')
                .unwrap_or(rest.len());
            let line = &rest[..end];
            self.cursor += end + 1;

            if let Some(fragment) = extract_fragment(line) {
                return Some(fragment);
            }
        }
        None
    }
}

// Keep-alive noise, non-objects and objects without text all yield nothing.
fn extract_fragment(line: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(line);
    if text.trim().is_empty() {
        return None;
    }

    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(mut record)) => match record.remove("response") {
            Some(Value::String(fragment)) if !fragment.is_empty() => Some(fragment),
            _ => None,
        },
        Ok(_) => None,
        Err(e) => {
            tracing::trace!("dropping malformed backend line: {}", e);
            None
        }
    }
}
