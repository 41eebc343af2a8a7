// ABOUTME: Transport seam between the pool/executor and whatever actually runs commands
//
// The pool and executor never talk to SSH directly. They go through three traits:
// - Connector: establishes one authenticated session to the configured endpoint
// - RemoteSession: a live session that can start processes
// - RemoteProcess: one running command, delivering output chunks and a final exit code
//
// `ssh` implements them on russh for production, `local` on portable-pty for
// development on a single machine.

pub mod local;
pub mod ssh;

use std::fmt;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use local::LocalConnector;
pub use ssh::SshConnector;

// === Transport Errors ===

/// Errors raised by a transport while connecting or while a process runs
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network-level failure (DNS, TCP, socket I/O)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// SSH protocol failure
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// Private key could not be loaded
    #[error("Key error: {0}")]
    Key(#[from] russh_keys::Error),

    /// The server rejected our credentials
    #[error("Authentication rejected for user '{user}'")]
    AuthRejected {
        /// User we tried to authenticate as
        user: String,
    },

    /// Host name did not resolve to any usable address
    #[error("Could not resolve host '{0}'")]
    Resolve(String),

    /// The session or channel went away underneath us
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Local PTY setup failed
    #[error("PTY error: {0}")]
    Pty(String),
}

impl TransportError {
    /// Whether the error means the session itself is no longer usable
    pub fn is_fatal_to_session(&self) -> bool {
        match self {
            Self::Io(_) | Self::Ssh(_) => true,
            Self::ChannelClosed(_)
            | Self::Key(_)
            | Self::AuthRejected { .. }
            | Self::Resolve(_)
            | Self::Pty(_) => false,
        }
    }
}

// === Process I/O ===

/// Terminal parameters requested for an interactive process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PtyRequest {
    /// Value for TERM on the remote side
    pub term: String,
    /// Terminal width in columns
    pub cols: u16,
    /// Terminal height in rows
    pub rows: u16,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "xterm".to_string(),
            cols: 80,
            rows: 24,
        }
    }
}

/// One item of output from a running process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutput {
    /// Bytes written to stdout (or the terminal, in PTY mode)
    Stdout(Vec<u8>),
    /// Bytes written to stderr
    Stderr(Vec<u8>),
    /// The process exited with this code. Always the last item.
    Exit(u32),
}

// === Transport Traits ===

/// Establishes sessions to a single fixed endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open and authenticate a new session
    ///
    /// Must not leave anything half-open behind on failure.
    async fn connect(&self) -> Result<Arc<dyn RemoteSession>, TransportError>;

    /// Human-readable endpoint description for logs
    fn endpoint(&self) -> String;
}

/// A live, authenticated session
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Start `command`, optionally attached to a pseudo-terminal
    async fn spawn(
        &self,
        command: &str,
        pty: Option<&PtyRequest>,
    ) -> Result<Box<dyn RemoteProcess>, TransportError>;

    /// Whether the session has been closed by either side
    fn is_closed(&self) -> bool;

    /// Close the session. Idempotent.
    async fn close(&self);
}

/// A running command
#[async_trait]
pub trait RemoteProcess: Send {
    /// Next chunk of output; `None` once the process is fully finished
    ///
    /// After `ProcessOutput::Exit` is returned, subsequent calls return `None`.
    async fn next_output(&mut self) -> Option<Result<ProcessOutput, TransportError>>;

    /// Best-effort termination of the process
    async fn terminate(&mut self) -> Result<(), TransportError>;
}

/// Opaque identifier for a pooled session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub uuid::Uuid);

impl ConnectionId {
    /// Generate a new unique connection ID
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to correlate log lines
        let full = self.0.to_string();
        write!(f, "conn-{}", &full[..8])
    }
}
