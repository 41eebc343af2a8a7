// ABOUTME: Streaming execution of interactive remote commands as structured events
//
// Key components:
// - terminal: control-sequence stripping that survives chunk boundaries
// - decoder: UTF-8 carry-over, line splitting and JSON decoding
// - events: ExecutionEvent and its inspection helpers
// - stream: RemoteStreamExecutor and the EventStream it returns

pub mod decoder;
pub mod events;
pub mod stream;
pub mod terminal;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::pool::config::duration_secs;
use crate::remote::PtyRequest;

pub use decoder::OutputDecoder;
pub use events::{ExecutionEvent, TokenUsage};
pub use stream::{EventStream, RemoteStreamExecutor};
pub use terminal::TerminalCleaner;

/// Settings for streaming executions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Terminal requested for every streamed command
    pub pty: PtyRequest,

    /// Stderr kept for the final error event
    pub max_stderr_bytes: usize,

    /// How long to wait for an abandoned process to terminate
    #[serde(with = "duration_secs")]
    pub terminate_timeout: Duration,

    /// Longest unterminated escape sequence held back between chunks
    pub max_pending_escape: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            pty: PtyRequest::default(),
            max_stderr_bytes: 64 * 1024,
            terminate_timeout: Duration::from_secs(5),
            max_pending_escape: terminal::DEFAULT_MAX_PENDING_ESCAPE,
        }
    }
}
