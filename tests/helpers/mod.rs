// ABOUTME: Scripted in-memory transport for integration tests
//
// Provides:
// - ScriptedConnector: a Connector whose processes replay canned output
// - Step: one scripted action of a process (output, exit, failure, delay)
// - Counters for connects, closes, spawns and terminations

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ptygate::pool::{ConnectionPool, PoolConfig};
use ptygate::remote::{
    Connector, ProcessOutput, PtyRequest, RemoteProcess, RemoteSession, TransportError,
};

/// One scripted action of a process
#[derive(Debug, Clone)]
pub enum Step {
    /// Write text to stdout
    Stdout(String),
    /// Write raw bytes to stdout
    Bytes(Vec<u8>),
    /// Write text to stderr
    Stderr(String),
    /// Exit with this code
    Exit(u32),
    /// Fail with a connection-level error
    Fail(String),
    /// Fail with a channel-level error, leaving the session usable
    CloseChannel(String),
    /// Sleep before the next step
    Pause(Duration),
    /// Never produce anything again
    Hang,
}

pub fn out(text: &str) -> Step {
    Step::Stdout(text.to_string())
}

pub fn err(text: &str) -> Step {
    Step::Stderr(text.to_string())
}

struct Rule {
    pattern: String,
    steps: Vec<Step>,
}

/// A spawned command as the transport saw it
#[derive(Debug, Clone)]
pub struct SpawnRecord {
    pub command: String,
    pub pty: bool,
}

#[derive(Default)]
struct Shared {
    rules: Mutex<Vec<Rule>>,
    spawned: Mutex<Vec<SpawnRecord>>,
    sessions: Mutex<Vec<Arc<ScriptedSession>>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    terminates: AtomicUsize,
    failing_connects: AtomicUsize,
    connect_delay: Mutex<Option<Duration>>,
    ignore_terminate: AtomicBool,
}

/// Connector whose processes replay scripted steps
///
/// A command runs the steps of the first rule whose pattern it contains;
/// unmatched commands exit 0 without output.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    shared: Arc<Shared>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script every command containing `pattern`
    pub fn on(&self, pattern: &str, steps: Vec<Step>) -> &Self {
        self.shared.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            steps,
        });
        self
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_next_connects(&self, count: usize) {
        self.shared.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Delay every connection attempt
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.shared.connect_delay.lock().unwrap() = Some(delay);
    }

    /// Make terminate() hang forever
    pub fn ignore_terminate(&self) {
        self.shared.ignore_terminate.store(true, Ordering::SeqCst);
    }

    /// Simulate the network dropping every open session
    pub fn drop_all_sessions(&self) {
        for session in self.shared.sessions.lock().unwrap().iter() {
            session.closed.store(true, Ordering::SeqCst);
        }
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub fn terminates(&self) -> usize {
        self.shared.terminates.load(Ordering::SeqCst)
    }

    pub fn spawned(&self) -> Vec<SpawnRecord> {
        self.shared.spawned.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.spawned().into_iter().map(|record| record.command).collect()
    }

    /// Build a pool on this connector
    pub fn pool(&self, config: PoolConfig) -> ConnectionPool {
        ConnectionPool::new(config, Arc::new(self.clone())).unwrap()
    }

    fn script_for(&self, command: &str) -> Vec<Step> {
        self.shared
            .rules
            .lock()
            .unwrap()
            .iter()
            .find(|rule| command.contains(&rule.pattern))
            .map_or_else(|| vec![Step::Exit(0)], |rule| rule.steps.clone())
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Arc<dyn RemoteSession>, TransportError> {
        let delay = *self.shared.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self.shared.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.shared.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "scripted refusal",
            )));
        }

        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(ScriptedSession {
            connector: self.clone(),
            closed: AtomicBool::new(false),
        });
        self.shared.sessions.lock().unwrap().push(Arc::clone(&session));
        Ok(session)
    }

    fn endpoint(&self) -> String {
        "scripted@test:22".to_string()
    }
}

pub struct ScriptedSession {
    connector: ScriptedConnector,
    closed: AtomicBool,
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn spawn(
        &self,
        command: &str,
        pty: Option<&PtyRequest>,
    ) -> Result<Box<dyn RemoteProcess>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Io(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        self.connector.shared.spawned.lock().unwrap().push(SpawnRecord {
            command: command.to_string(),
            pty: pty.is_some(),
        });
        Ok(Box::new(ScriptedProcess {
            steps: self.connector.script_for(command).into(),
            shared: Arc::clone(&self.connector.shared),
            finished: false,
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.connector.shared.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct ScriptedProcess {
    steps: VecDeque<Step>,
    shared: Arc<Shared>,
    finished: bool,
}

#[async_trait]
impl RemoteProcess for ScriptedProcess {
    async fn next_output(&mut self) -> Option<Result<ProcessOutput, TransportError>> {
        while !self.finished {
            let Some(step) = self.steps.pop_front() else {
                self.finished = true;
                break;
            };
            match step {
                Step::Stdout(text) => return Some(Ok(ProcessOutput::Stdout(text.into_bytes()))),
                Step::Bytes(bytes) => return Some(Ok(ProcessOutput::Stdout(bytes))),
                Step::Stderr(text) => return Some(Ok(ProcessOutput::Stderr(text.into_bytes()))),
                Step::Exit(code) => {
                    self.finished = true;
                    return Some(Ok(ProcessOutput::Exit(code)));
                }
                Step::Fail(reason) => {
                    self.finished = true;
                    return Some(Err(TransportError::Io(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        reason,
                    ))));
                }
                Step::CloseChannel(reason) => {
                    self.finished = true;
                    return Some(Err(TransportError::ChannelClosed(reason)));
                }
                Step::Pause(delay) => tokio::time::sleep(delay).await,
                Step::Hang => std::future::pending::<()>().await,
            }
        }
        None
    }

    async fn terminate(&mut self) -> Result<(), TransportError> {
        if self.shared.ignore_terminate.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.shared.terminates.fetch_add(1, Ordering::SeqCst);
        self.finished = true;
        Ok(())
    }
}

/// Pool settings for tests: small, short timeouts, no reaping unless asked
pub fn test_pool_config(max_connections: usize) -> PoolConfig {
    PoolConfig {
        max_connections,
        connect_timeout: Duration::from_secs(5),
        acquire_timeout: Duration::from_secs(5),
        idle_timeout: Duration::from_secs(3600),
        reap_interval: Duration::from_secs(3600),
        exec_timeout: Duration::from_secs(5),
        ..PoolConfig::default()
    }
}

/// Let spawned tasks run until they block
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
