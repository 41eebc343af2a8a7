// ABOUTME: Strips terminal control sequences from PTY output that arrives in chunks
//
// A sequence split across two chunks is held back until the rest arrives, so
// the line splitter never sees half an escape code.

use lazy_static::lazy_static;
use regex::Regex;

/// Longest unterminated escape sequence held back before it is released as text
pub const DEFAULT_MAX_PENDING_ESCAPE: usize = 256;

lazy_static! {
    /// Complete control sequences
    static ref CONTROL_SEQUENCE: Regex = Regex::new(concat!(
        // CSI: cursor movement, colors, modes
        r"\x1b\[[0-?]*[ -/]*[@-~]",
        // OSC, DCS, SOS, PM and APC strings, BEL or ST terminated
        r"|\x1b[\]PX^_][^\x07\x1b]*(?:\x07|\x1b\\)",
        // Intermediate bytes then a final byte (character sets, DEC tests)
        r"|\x1b[ -/]+[0-~]",
        // Two-byte sequences: Fp, Fe and Fs (keypad modes, RIS, cursor save/restore)
        r"|\x1b[0-?@-OQ-WYZ\\`-~]",
    ))
    .unwrap();

    /// An escape sequence cut off at the end of the text
    static ref PARTIAL_TAIL: Regex =
        Regex::new(r"\x1b(?:\[[0-?]*[ -/]*|[\]PX^_][^\x07\x1b]*\x1b?|[ -/]+)?$").unwrap();
}

/// Removes control sequences and carriage returns from a stream of text
#[derive(Debug, Clone)]
pub struct TerminalCleaner {
    pending: String,
    max_pending: usize,
}

impl Default for TerminalCleaner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING_ESCAPE)
    }
}

impl TerminalCleaner {
    /// Create a cleaner that holds back at most `max_pending` bytes of an
    /// unterminated sequence
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: String::new(),
            max_pending,
        }
    }

    /// Clean the next piece of text
    ///
    /// Returns everything that can be emitted now; an escape sequence that is
    /// still open at the end of `text` is kept for the next call.
    pub fn clean(&mut self, text: &str) -> String {
        let mut input = std::mem::take(&mut self.pending);
        input.push_str(text);

        let split = match PARTIAL_TAIL.find(&input) {
            Some(tail) if input.len() - tail.start() <= self.max_pending => tail.start(),
            _ => input.len(),
        };
        self.pending = input[split..].to_string();
        strip(&input[..split])
    }

    /// Flush at end of stream; an unterminated sequence is discarded
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        let cleaned = strip(&rest);
        PARTIAL_TAIL.replace(&cleaned, "").into_owned()
    }

    /// Bytes currently held back
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Strip complete control sequences and carriage returns from `text`
pub fn strip(text: &str) -> String {
    CONTROL_SEQUENCE.replace_all(text, "").replace('\r', "")
}
