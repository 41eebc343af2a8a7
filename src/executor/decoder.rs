// ABOUTME: Turns raw PTY bytes into decoded JSON records, one per output line
//
// Pipeline per chunk: UTF-8 decode (carrying split code points over), strip
// control sequences, append to the line buffer, decode every complete line.
// The unterminated tail stays buffered until more bytes or `finish()` arrive.

use serde_json::Value;
use tracing::{debug, warn};

use super::terminal::TerminalCleaner;

/// Longest prefix of a bad line included in the warning
const MAX_LOGGED_LINE_CHARS: usize = 200;

/// Incremental NDJSON decoder for terminal output
#[derive(Debug, Default)]
pub struct OutputDecoder {
    utf8_carry: Vec<u8>,
    cleaner: TerminalCleaner,
    line_buffer: String,
    malformed_lines: usize,
}

impl OutputDecoder {
    /// Create a decoder with a custom control-sequence cleaner
    pub fn new(cleaner: TerminalCleaner) -> Self {
        Self {
            cleaner,
            ..Self::default()
        }
    }

    /// Feed one chunk and return the records completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        let text = self.decode_utf8(chunk);
        let cleaned = self.cleaner.clean(&text);
        self.line_buffer.push_str(&cleaned);
        self.drain_complete_lines()
    }

    /// Flush everything still buffered, treating the tail as a final line
    pub fn finish(&mut self) -> Vec<Value> {
        let carry = std::mem::take(&mut self.utf8_carry);
        if !carry.is_empty() {
            let text = String::from_utf8_lossy(&carry);
            let cleaned = self.cleaner.clean(&text);
            self.line_buffer.push_str(&cleaned);
        }
        let rest = self.cleaner.finish();
        self.line_buffer.push_str(&rest);

        let mut records = self.drain_complete_lines();
        let tail = std::mem::take(&mut self.line_buffer);
        records.extend(self.decode_line(&tail));
        records
    }

    /// Lines dropped because they were not valid JSON
    pub fn malformed_lines(&self) -> usize {
        self.malformed_lines
    }

    fn decode_utf8(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.utf8_carry);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest: &[u8] = &bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            // Code point continues in the next chunk
                            self.utf8_carry = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    fn drain_complete_lines(&mut self) -> Vec<Value> {
        let Some(last_newline) = self.line_buffer.rfind('\n') else {
            return Vec::new();
        };
        let tail = self.line_buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.line_buffer, tail);

        complete
            .split('\n')
            .filter_map(|line| self.decode_line(line))
            .collect()
    }

    fn decode_line(&mut self, line: &str) -> Option<Value> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => {
                let record_type = value.get("type").and_then(Value::as_str).unwrap_or("unknown");
                debug!(record_type, "Decoded output record");
                Some(value)
            }
            Err(e) => {
                self.malformed_lines += 1;
                let preview: String = trimmed.chars().take(MAX_LOGGED_LINE_CHARS).collect();
                warn!(error = %e, line = %preview, "Dropping output line that is not valid JSON");
                None
            }
        }
    }
}
