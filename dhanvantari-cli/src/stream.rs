//! Incremental parser for the chat endpoint's event stream.
//!
//! The body looks like
//! ```text
//! data: {"choices":[{"delta":{"content":"Hel"}}]}
//! data: {"choices":[{"delta":{"content":"lo"}}]}
//! data: [DONE]
//! ```
//! and arrives in chunks that can split a line, a JSON payload or a UTF-8
//! sequence anywhere.

use dhanvantari_shared::StreamChunk;
use tracing::debug;

const DATA_PREFIX: &str = "data: ";
const DONE_LINE: &str = "data: [DONE]";

#[derive(Debug, PartialEq)]
enum LineEvent {
    Delta(String),
    Done,
    Skip,
}

fn classify_line(line: &str) -> LineEvent {
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return LineEvent::Skip;
    };
    if line == DONE_LINE {
        return LineEvent::Done;
    }

    let payload = payload.trim();
    if payload.is_empty() {
        return LineEvent::Skip;
    }

    match serde_json::from_str::<StreamChunk>(payload) {
        Ok(chunk) => chunk
            .into_content()
            .map_or(LineEvent::Skip, LineEvent::Delta),
        Err(e) => {
            debug!("Skipping malformed event: {}", e);
            LineEvent::Skip
        }
    }
}

/// Owned per-request buffer turning raw chunks into content deltas.
///
/// Not restartable: once `[DONE]` is seen or [`LineParser::finish`] is
/// called, every later push yields nothing.
#[derive(Debug, Default)]
pub struct LineParser {
    buffer: String,
    // Tail of a UTF-8 sequence split across byte chunks.
    pending: Vec<u8>,
    done: bool,
}

impl LineParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<String> {
        if self.done {
            return Vec::new();
        }
        self.pending.extend_from_slice(bytes);
        self.decode_pending();
        self.drain_lines()
    }

    #[cfg(test)]
    pub fn push_str(&mut self, chunk: &str) -> Vec<String> {
        if self.done {
            return Vec::new();
        }
        self.flush_pending_lossy();
        self.buffer.push_str(chunk);
        self.drain_lines()
    }

    /// Flush whatever is left once the transport has ended.
    pub fn finish(&mut self) -> Vec<String> {
        if self.done {
            return Vec::new();
        }
        self.flush_pending_lossy();
        self.done = true;

        let residual = std::mem::take(&mut self.buffer);
        let mut deltas = Vec::new();
        if residual.trim().is_empty() {
            return deltas;
        }

        for line in residual.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.trim().is_empty() {
                continue;
            }
            match classify_line(line) {
                LineEvent::Delta(delta) => deltas.push(delta),
                LineEvent::Done => break,
                LineEvent::Skip => {}
            }
        }
        deltas
    }

    fn decode_pending(&mut self) {
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.pending.clear();
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.buffer
                        .push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(invalid) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + invalid);
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more bytes.
                            self.pending.drain(..valid);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn flush_pending_lossy(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let tail = std::mem::take(&mut self.pending);
        self.buffer.push_str(&String::from_utf8_lossy(&tail));
    }

    fn drain_lines(&mut self) -> Vec<String> {
        let mut deltas = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let raw: String = self.buffer.drain(..=pos).collect();
            let line = &raw[..raw.len() - 1];
            let line = line.strip_suffix('\r').unwrap_or(line);

            match classify_line(line) {
                LineEvent::Delta(delta) => deltas.push(delta),
                LineEvent::Done => {
                    debug!("Received [DONE] sentinel");
                    self.done = true;
                    self.buffer.clear();
                    self.pending.clear();
                    break;
                }
                LineEvent::Skip => {}
            }
        }
        deltas
    }
}
