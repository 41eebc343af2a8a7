// ABOUTME: Local transport for development mode, running commands on this machine
//
// Interactive processes get a real pseudo-terminal through portable-pty, so the
// executor sees the same control-sequence-polluted byte stream it sees over SSH.
// Non-interactive processes use tokio::process with separate stdout/stderr pipes.

use std::io::Read;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{Connector, ProcessOutput, PtyRequest, RemoteProcess, RemoteSession, TransportError};

/// Exit code reported when the local process ended without one (killed by a signal)
const SIGNALED_EXIT_CODE: u32 = 255;

type OutputSender = mpsc::UnboundedSender<Result<ProcessOutput, TransportError>>;
type OutputReceiver = mpsc::UnboundedReceiver<Result<ProcessOutput, TransportError>>;

/// Runs commands through the local shell
#[derive(Debug, Clone)]
pub struct LocalConnector {
    shell: PathBuf,
}

impl LocalConnector {
    /// Use the first `sh` on PATH
    pub fn new() -> Self {
        let shell = which::which("sh").unwrap_or_else(|_| PathBuf::from("/bin/sh"));
        Self { shell }
    }

    /// Use a specific shell binary (must accept `-c <command>`)
    pub fn with_shell(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for LocalConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self) -> Result<Arc<dyn RemoteSession>, TransportError> {
        Ok(Arc::new(LocalSession {
            shell: self.shell.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn endpoint(&self) -> String {
        format!("local:{}", self.shell.display())
    }
}

/// A pseudo-session; local commands need no connection state
pub struct LocalSession {
    shell: PathBuf,
    closed: AtomicBool,
}

impl LocalSession {
    fn spawn_pty(&self, command: &str, pty: &PtyRequest) -> Result<LocalProcess, TransportError> {
        let pty_system = portable_pty::native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: pty.rows,
                cols: pty.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TransportError::Pty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.arg("-c");
        cmd.arg(command);
        cmd.env("TERM", &pty.term);

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TransportError::Pty(e.to_string()))?;
        // The reader only sees EOF once every slave handle is gone
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TransportError::Pty(e.to_string()))?;
        let killer = child.clone_killer();

        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("ptygate-local-pty".to_string())
            .spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(Ok(ProcessOutput::Stdout(buf[..n].to_vec()))).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                        // Linux reports EIO once the slave side has closed
                        Err(_) => break,
                    }
                }
                let outcome = child
                    .wait()
                    .map(|status| ProcessOutput::Exit(status.exit_code()))
                    .map_err(TransportError::Io);
                let _ = tx.send(outcome);
            })?;

        Ok(LocalProcess {
            rx,
            stopper: Stopper::Pty(Some(killer)),
            finished: false,
            _master: Some(pair.master),
        })
    }

    fn spawn_piped(&self, command: &str) -> Result<LocalProcess, TransportError> {
        let mut child = tokio::process::Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (tx, rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let pumps = async {
                tokio::join!(
                    pump(stdout, tx.clone(), ProcessOutput::Stdout),
                    pump(stderr, tx.clone(), ProcessOutput::Stderr),
                );
            };

            // A dropped process handle counts as a kill request too
            let killed = tokio::select! {
                () = pumps => false,
                _ = kill_rx => true,
            };
            if killed {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill local process");
                }
            }
            let status = child.wait().await;

            let outcome = status
                .map(|s| {
                    ProcessOutput::Exit(
                        s.code()
                            .and_then(|c| u32::try_from(c).ok())
                            .unwrap_or(SIGNALED_EXIT_CODE),
                    )
                })
                .map_err(TransportError::Io);
            let _ = tx.send(outcome);
        });

        Ok(LocalProcess {
            rx,
            stopper: Stopper::Piped(Some(kill_tx)),
            finished: false,
            _master: None,
        })
    }
}

async fn pump<R>(reader: Option<R>, tx: OutputSender, wrap: fn(Vec<u8>) -> ProcessOutput)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Ok(wrap(buf[..n].to_vec()))).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(TransportError::Io(e)));
                break;
            }
        }
    }
}

#[async_trait]
impl RemoteSession for LocalSession {
    async fn spawn(
        &self,
        command: &str,
        pty: Option<&PtyRequest>,
    ) -> Result<Box<dyn RemoteProcess>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed("local session closed".to_string()));
        }
        debug!(pty = pty.is_some(), "Starting local command");
        let process = match pty {
            Some(pty) => self.spawn_pty(command, pty)?,
            None => self.spawn_piped(command)?,
        };
        Ok(Box::new(process))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

enum Stopper {
    Pty(Option<Box<dyn ChildKiller + Send + Sync>>),
    Piped(Option<oneshot::Sender<()>>),
}

/// A local child process and the channel its output arrives on
struct LocalProcess {
    rx: OutputReceiver,
    stopper: Stopper,
    finished: bool,
    // Keeps the PTY open for as long as the process is read
    _master: Option<Box<dyn MasterPty + Send>>,
}

#[async_trait]
impl RemoteProcess for LocalProcess {
    async fn next_output(&mut self) -> Option<Result<ProcessOutput, TransportError>> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(Ok(ProcessOutput::Exit(code))) => {
                self.finished = true;
                Some(Ok(ProcessOutput::Exit(code)))
            }
            Some(other) => Some(other),
            None => {
                self.finished = true;
                Some(Err(TransportError::ChannelClosed(
                    "local process output ended without an exit status".to_string(),
                )))
            }
        }
    }

    async fn terminate(&mut self) -> Result<(), TransportError> {
        match &mut self.stopper {
            Stopper::Pty(killer) => {
                if let Some(mut killer) = killer.take() {
                    killer.kill()?;
                }
            }
            Stopper::Piped(kill_tx) => {
                if let Some(kill_tx) = kill_tx.take() {
                    let _ = kill_tx.send(());
                }
            }
        }
        Ok(())
    }
}

impl Drop for LocalProcess {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Stopper::Pty(Some(killer)) = &mut self.stopper {
            let _ = killer.kill();
        }
        // Piped children are killed when their kill sender drops
    }
}
