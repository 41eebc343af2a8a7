// ABOUTME: Runs one command under a PTY on a pooled connection and streams decoded events
// ABOUTME: A producer task owns the connection lease, so every exit path releases it once

#![warn(missing_docs)]

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::{debug, error, info, warn};

use super::decoder::OutputDecoder;
use super::events::ExecutionEvent;
use super::terminal::TerminalCleaner;
use super::ExecutorConfig;
use crate::pool::PooledConnection;
use crate::remote::{ProcessOutput, RemoteProcess, TransportError};

// === Event Stream ===

/// Events of one execution, in production order
///
/// Production runs ahead of consumption without bound. Dropping the stream
/// cancels the execution: the remote process is terminated and the
/// connection goes back to the pool.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<ExecutionEvent>,
}

impl EventStream {
    /// Next event; `None` once the execution has finished
    pub async fn next_event(&mut self) -> Option<ExecutionEvent> {
        self.rx.recv().await
    }

    /// Drain the stream to completion
    pub async fn collect_events(mut self) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }
}

impl Stream for EventStream {
    type Item = ExecutionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// === Stderr Capture ===

/// Stderr kept for the final error event, capped in size
#[derive(Debug)]
struct StderrCapture {
    bytes: Vec<u8>,
    limit: usize,
    dropped: usize,
}

impl StderrCapture {
    fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        let take = room.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..take]);
        self.dropped += chunk.len() - take;
    }

    fn text(&self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.bytes).trim().to_string();
        match (text.is_empty(), self.dropped) {
            (true, 0) => None,
            (_, 0) => Some(text),
            (_, dropped) => Some(format!("{text}\n[stderr truncated, {dropped} bytes dropped]")),
        }
    }
}

// === Executor ===

enum Outcome {
    Exited(u32),
    Failed(TransportError),
    Abandoned,
}

/// Streams structured events from an interactive remote process
#[derive(Debug, Clone, Default)]
pub struct RemoteStreamExecutor {
    config: ExecutorConfig,
}

impl RemoteStreamExecutor {
    /// Create an executor with the given settings
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Get the executor configuration
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Start `command` under a PTY on `conn` and stream its output records
    ///
    /// The lease moves into the producer task and is released when the
    /// process ends, the transport fails or the stream is dropped.
    /// Non-zero exits and transport failures arrive as a final
    /// [`ExecutionEvent::Error`] rather than as an `Err`.
    pub fn exec_stream(&self, conn: PooledConnection, command: impl Into<String>) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = self.config.clone();
        let command = command.into();

        tokio::spawn(produce(conn, command, config, tx));
        EventStream { rx }
    }
}

fn emit_all(tx: &mpsc::UnboundedSender<ExecutionEvent>, records: Vec<serde_json::Value>) -> bool {
    records
        .into_iter()
        .all(|record| tx.send(ExecutionEvent::data(record)).is_ok())
}

async fn produce(
    conn: PooledConnection,
    command: String,
    config: ExecutorConfig,
    tx: mpsc::UnboundedSender<ExecutionEvent>,
) {
    let connection_id = conn.id();
    let mut process = match conn.spawn(&command, Some(&config.pty)).await {
        Ok(process) => process,
        Err(e) => {
            error!(%connection_id, error = %e, "Failed to start remote command");
            let _ = tx.send(ExecutionEvent::error(format!(
                "Failed to start remote command: {e}"
            )));
            return;
        }
    };
    debug!(%connection_id, "Streaming remote command");

    let mut decoder = OutputDecoder::new(TerminalCleaner::new(config.max_pending_escape));
    let mut stderr = StderrCapture::new(config.max_stderr_bytes);

    let outcome = 'pump: loop {
        let item = tokio::select! {
            item = process.next_output() => item,
            () = tx.closed() => break 'pump Outcome::Abandoned,
        };

        match item {
            Some(Ok(ProcessOutput::Stdout(bytes))) => {
                if !emit_all(&tx, decoder.push(&bytes)) {
                    break 'pump Outcome::Abandoned;
                }
            }
            Some(Ok(ProcessOutput::Stderr(bytes))) => stderr.push(&bytes),
            Some(Ok(ProcessOutput::Exit(code))) => break 'pump Outcome::Exited(code),
            Some(Err(e)) => break 'pump Outcome::Failed(e),
            None => {
                break 'pump Outcome::Failed(TransportError::ChannelClosed(
                    "process output ended without an exit status".to_string(),
                ))
            }
        }
    };

    match outcome {
        Outcome::Exited(code) => {
            emit_all(&tx, decoder.finish());
            if code == 0 {
                debug!(%connection_id, "Remote command completed");
            } else {
                let stderr = stderr.text();
                warn!(%connection_id, exit_code = code, stderr = ?stderr, "Remote command failed");
                let detail = stderr.as_deref().unwrap_or("no error output");
                let _ = tx.send(ExecutionEvent::Error {
                    message: format!("Command failed (exit code {code}): {detail}"),
                    exit_code: Some(code),
                    stderr,
                });
            }
        }
        Outcome::Failed(e) => {
            emit_all(&tx, decoder.finish());
            if e.is_fatal_to_session() {
                conn.mark_broken();
            }
            error!(%connection_id, error = %e, "Remote command stream failed");
            let _ = tx.send(ExecutionEvent::Error {
                message: format!("Execution failed: {e}"),
                exit_code: None,
                stderr: stderr.text(),
            });
        }
        Outcome::Abandoned => {
            info!(%connection_id, "Stream abandoned, terminating remote command");
            terminate(process.as_mut(), &conn, &config).await;
        }
    }

    if decoder.malformed_lines() > 0 {
        debug!(%connection_id, dropped = decoder.malformed_lines(), "Dropped undecodable lines");
    }

    drop(process);
    drop(conn);
}

async fn terminate(process: &mut dyn RemoteProcess, conn: &PooledConnection, config: &ExecutorConfig) {
    match tokio::time::timeout(config.terminate_timeout, process.terminate()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(connection_id = %conn.id(), error = %e, "Failed to terminate remote command");
            if e.is_fatal_to_session() {
                conn.mark_broken();
            }
        }
        Err(_) => {
            // A channel that will not close is not worth handing to someone else
            warn!(connection_id = %conn.id(), "Timed out terminating remote command");
            conn.mark_broken();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_capture_under_limit() {
        let mut capture = StderrCapture::new(16);
        capture.push(b"boom\n");
        assert_eq!(capture.text().as_deref(), Some("boom"));
    }

    #[test]
    fn test_stderr_capture_truncates() {
        let mut capture = StderrCapture::new(4);
        capture.push(b"abc");
        capture.push(b"defg");
        let text = capture.text().unwrap();
        assert!(text.starts_with("abcd\n"));
        assert!(text.contains("3 bytes dropped"));
    }

    #[test]
    fn test_stderr_capture_empty() {
        let mut capture = StderrCapture::new(4);
        capture.push(b"  \n");
        assert_eq!(capture.text(), None);
    }
}
