// ABOUTME: Bounded pool of authenticated remote sessions with FIFO waiters and idle reaping
// ABOUTME: Hands out PooledConnection leases that return themselves to the pool on drop

//! Connection Pool
//!
//! `ConnectionPool` owns every session to the remote endpoint and lends them out
//! one caller at a time.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     ConnectionPool                       │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ PoolState (one mutex)                              │  │
//! │  │   slots:      [conn-1a2b idle] [conn-3c4d in_use]  │  │
//! │  │   connecting: 1                                    │  │
//! │  │   waiters:    ticket 7 -> ticket 8 -> ticket 9     │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │  ┌────────────┐  ┌─────────────┐  ┌──────────────────┐   │
//! │  │ Connector  │  │ PoolMetrics │  │ reaper task      │   │
//! │  │ (ssh/local)│  │             │  │ (Weak reference) │   │
//! │  └────────────┘  └─────────────┘  └──────────────────┘   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Capacity is `slots.len() + connecting`, so a connection being established
//! counts against `max_connections` for its whole handshake.
//!
//! A released connection is handed straight to the oldest waiter rather than
//! parked as idle, so a newcomer can never overtake someone already queued. A
//! connection that is evicted instead hands its capacity to the oldest waiter
//! as a vacancy, which that waiter fills by connecting.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::config::PoolConfig;
use super::metrics::{PoolMetrics, PoolMetricsSnapshot};
use crate::remote::{
    ConnectionId, Connector, ProcessOutput, PtyRequest, RemoteProcess, RemoteSession,
    TransportError,
};

/// How long a timed-out `exec` command gets to stop before its lease is evicted
const EXEC_TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

// === Pool Errors ===

/// Errors that can occur during pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// No connection became free within the acquire timeout
    #[error("Timed out after {waited:?} waiting for a free connection")]
    AcquireTimeout {
        /// How long the caller waited
        waited: Duration,
    },

    /// Establishing a new connection took longer than the connect timeout
    #[error("Connecting to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Endpoint being dialed
        endpoint: String,
        /// Configured connect timeout
        timeout: Duration,
    },

    /// Establishing a new connection failed
    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        /// Endpoint being dialed
        endpoint: String,
        /// Underlying transport failure
        #[source]
        source: TransportError,
    },

    /// A non-streaming command did not finish in time
    #[error("Command timed out after {timeout:?}")]
    ExecTimeout {
        /// Timeout that applied
        timeout: Duration,
    },

    /// Transport failure while running a command
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The pool has been destroyed
    #[error("Connection pool has been shut down")]
    Closed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl PoolError {
    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AcquireTimeout { .. } | Self::ConnectTimeout { .. } | Self::Connect { .. }
        )
    }
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

// === Pool State ===

/// Lifecycle state of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Available for the next acquire
    Idle,
    /// Leased to exactly one caller
    InUse,
}

struct Slot {
    id: ConnectionId,
    session: Arc<dyn RemoteSession>,
    state: ConnectionState,
    last_used: Instant,
}

/// What a queued acquirer is handed when it reaches the front
enum Grant {
    /// An established connection, already marked in use
    Connection(ConnectionId, Arc<dyn RemoteSession>),
    /// Capacity for one new connection, already counted in `connecting`
    Vacancy,
}

struct Waiter {
    ticket: u64,
    tx: oneshot::Sender<Grant>,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<Slot>,
    connecting: usize,
    waiters: VecDeque<Waiter>,
    closed: bool,
}

impl PoolState {
    fn capacity_used(&self) -> usize {
        self.slots.len() + self.connecting
    }

    /// Give slot `index` to the oldest live waiter, or park it as idle
    fn hand_off(&mut self, index: usize) {
        let now = Instant::now();
        while let Some(waiter) = self.waiters.pop_front() {
            let slot = &mut self.slots[index];
            let grant = Grant::Connection(slot.id, Arc::clone(&slot.session));
            if waiter.tx.send(grant).is_ok() {
                slot.state = ConnectionState::InUse;
                slot.last_used = now;
                return;
            }
            // Receiver already gone; try the next one
        }
        let slot = &mut self.slots[index];
        slot.state = ConnectionState::Idle;
        slot.last_used = now;
    }

    /// Give one unit of free capacity to the oldest live waiter, if any
    fn offer_vacancy(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            self.connecting += 1;
            if waiter.tx.send(Grant::Vacancy).is_ok() {
                return;
            }
            self.connecting -= 1;
        }
    }

    /// Remove idle slots whose session died while parked
    fn take_dead_idle(&mut self) -> Vec<Arc<dyn RemoteSession>> {
        let mut dead = Vec::new();
        self.slots.retain(|slot| {
            let is_dead = slot.state == ConnectionState::Idle && slot.session.is_closed();
            if is_dead {
                dead.push(Arc::clone(&slot.session));
            }
            !is_dead
        });
        dead
    }
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    metrics: PoolMetrics,
    next_ticket: AtomicU64,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // No code path panics while holding the lock
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, id: ConnectionId, broken: bool) {
        let evicted = {
            let mut state = self.lock();
            let Some(index) = state.slots.iter().position(|slot| slot.id == id) else {
                debug!(connection_id = %id, "Released connection is no longer pooled");
                return;
            };
            if state.slots[index].state != ConnectionState::InUse {
                warn!(connection_id = %id, "Ignoring release of a connection that is not in use");
                return;
            }

            if broken || state.slots[index].session.is_closed() {
                let slot = state.slots.remove(index);
                if !state.closed {
                    state.offer_vacancy();
                }
                Some(slot.session)
            } else {
                state.hand_off(index);
                None
            }
        };

        match evicted {
            Some(session) => {
                self.metrics.connection_evicted();
                info!(connection_id = %id, "Evicting unhealthy connection");
                close_detached(session);
            }
            None => debug!(connection_id = %id, "Connection released"),
        }
    }

    /// Return a grant issued to a waiter that has since gone away
    fn return_grant(&self, grant: Grant) {
        match grant {
            Grant::Connection(id, _) => self.release(id, false),
            Grant::Vacancy => {
                let mut state = self.lock();
                state.connecting = state.connecting.saturating_sub(1);
                if !state.closed {
                    state.offer_vacancy();
                }
            }
        }
    }

    /// Remove a waiter from the queue; false if it was already granted
    fn withdraw(&self, ticket: u64) -> bool {
        let mut state = self.lock();
        match state.waiters.iter().position(|w| w.ticket == ticket) {
            Some(pos) => {
                state.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    async fn reap_idle(&self) -> usize {
        let reaped = {
            let mut state = self.lock();
            let now = Instant::now();
            let idle_timeout = self.config.idle_timeout;
            let mut reaped = Vec::new();
            state.slots.retain(|slot| {
                let expired = slot.state == ConnectionState::Idle
                    && (now.duration_since(slot.last_used) >= idle_timeout
                        || slot.session.is_closed());
                if expired {
                    reaped.push((slot.id, Arc::clone(&slot.session)));
                }
                !expired
            });
            for _ in 0..reaped.len() {
                if state.waiters.is_empty() {
                    break;
                }
                state.offer_vacancy();
            }
            reaped
        };

        for (id, session) in &reaped {
            info!(connection_id = %id, "Closing idle connection");
            session.close().await;
        }
        self.metrics.connections_reaped(reaped.len());
        reaped.len()
    }
}

/// Close a session without waiting, from a context that cannot await
fn close_detached(session: Arc<dyn RemoteSession>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            session.close().await;
        });
    }
}

async fn reaper_loop(pool: Weak<PoolInner>, period: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(inner) = pool.upgrade() else {
            break;
        };
        if inner.lock().closed {
            break;
        }
        let reaped = inner.reap_idle().await;
        if reaped > 0 {
            debug!(count = reaped, "Idle reaper pass complete");
        }
    }
}

// === Waiting and Connecting Guards ===

/// Stop a command that outlived its timeout
///
/// A command that cannot be confirmed stopped may still be running on the
/// session, so the lease is marked broken rather than handed to someone else.
async fn stop_timed_out(process: &mut dyn RemoteProcess, conn: &PooledConnection) {
    match tokio::time::timeout(EXEC_TERMINATE_TIMEOUT, process.terminate()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(connection_id = %conn.id, error = %e, "Failed to terminate timed-out command");
            conn.mark_broken();
        }
        Err(_) => {
            warn!(connection_id = %conn.id, "Timed-out command did not terminate");
            conn.mark_broken();
        }
    }
}

/// A queued acquire; withdraws itself (or hands back its grant) if dropped
struct PendingAcquire {
    inner: Arc<PoolInner>,
    ticket: u64,
    rx: oneshot::Receiver<Grant>,
    settled: bool,
}

impl PendingAcquire {
    async fn wait(mut self, deadline: Instant, timeout: Duration) -> PoolResult<Grant> {
        let outcome = match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(Ok(grant)) => Ok(grant),
            Ok(Err(_)) => Err(PoolError::Closed),
            Err(_) => {
                if self.inner.withdraw(self.ticket) {
                    Err(PoolError::AcquireTimeout { waited: timeout })
                } else {
                    // Granted between the deadline and the withdrawal
                    self.rx.try_recv().map_err(|_| PoolError::Closed)
                }
            }
        };
        self.settled = true;
        outcome
    }
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if self.settled || self.inner.withdraw(self.ticket) {
            return;
        }
        if let Ok(grant) = self.rx.try_recv() {
            self.inner.return_grant(grant);
        }
    }
}

/// One unit of capacity reserved for a connection being established
struct Reservation {
    inner: Arc<PoolInner>,
    active: bool,
}

impl Reservation {
    /// Turn the reservation into a pooled, in-use slot
    fn fulfil(mut self, id: ConnectionId, session: &Arc<dyn RemoteSession>) -> PoolResult<()> {
        self.active = false;
        let mut state = self.inner.lock();
        state.connecting = state.connecting.saturating_sub(1);
        if state.closed {
            return Err(PoolError::Closed);
        }
        state.slots.push(Slot {
            id,
            session: Arc::clone(session),
            state: ConnectionState::InUse,
            last_used: Instant::now(),
        });
        Ok(())
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let mut state = self.inner.lock();
        state.connecting = state.connecting.saturating_sub(1);
        if !state.closed {
            state.offer_vacancy();
        }
    }
}

// === Leases ===

/// Exclusive use of one pooled connection
///
/// Dropping the lease returns the connection to the pool exactly once.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    id: ConnectionId,
    session: Arc<dyn RemoteSession>,
    broken: AtomicBool,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("broken", &self.is_broken())
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// Identifier of the underlying connection
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Flag the connection so it is closed instead of reused on release
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    /// Whether the connection has been flagged as broken
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Start a process on this connection
    ///
    /// Failures that take the whole session down mark the lease broken.
    pub async fn spawn(
        &self,
        command: &str,
        pty: Option<&PtyRequest>,
    ) -> Result<Box<dyn RemoteProcess>, TransportError> {
        let result = self.session.spawn(command, pty).await;
        if let Err(e) = &result {
            if e.is_fatal_to_session() {
                self.mark_broken();
            }
        }
        result
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.release(self.id, self.is_broken());
    }
}

// === Exec ===

/// Options for a non-streaming command
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Overrides the pool's default exec timeout
    pub timeout: Option<Duration>,
    /// Directory to run the command in
    pub cwd: Option<String>,
}

/// Collected result of a non-streaming command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecOutput {
    /// Everything the command wrote to stdout
    pub stdout: String,
    /// Everything the command wrote to stderr
    pub stderr: String,
    /// Exit code; `None` when the channel closed without reporting one
    pub exit_code: Option<u32>,
}

impl ExecOutput {
    /// True when the command exited with status 0
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

// === Stats ===

/// Snapshot of one pooled connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Connection identifier
    pub id: String,
    /// Idle or in use
    pub state: ConnectionState,
    /// Time since the connection was last handed out or returned
    pub idle_for_ms: u64,
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Configured capacity
    pub max_connections: usize,
    /// Established connections (idle + in use)
    pub total: usize,
    /// Connections ready to be acquired
    pub idle: usize,
    /// Connections currently leased
    pub in_use: usize,
    /// Connections being established
    pub connecting: usize,
    /// Acquirers queued for a connection
    pub waiting: usize,
    /// Whether the pool has been destroyed
    pub closed: bool,
    /// Cumulative counters
    pub metrics: PoolMetricsSnapshot,
}

// === Connection Pool ===

/// Bounded pool of sessions to a single remote endpoint
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.inner.connector.endpoint())
            .field("max_connections", &self.inner.config.max_connections)
            .finish_non_exhaustive()
    }
}

enum AcquireStep {
    Ready(ConnectionId, Arc<dyn RemoteSession>),
    Connect,
    Wait(u64, oneshot::Receiver<Grant>),
}

impl ConnectionPool {
    /// Create a pool and start its idle reaper
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> PoolResult<Self> {
        config.validate().map_err(PoolError::ConfigError)?;
        let reap_interval = config.reap_interval;

        let inner = Arc::new(PoolInner {
            config,
            connector,
            state: Mutex::new(PoolState::default()),
            metrics: PoolMetrics::new(),
            next_ticket: AtomicU64::new(0),
            reaper: Mutex::new(None),
        });

        let reaper = tokio::spawn(reaper_loop(Arc::downgrade(&inner), reap_interval));
        *inner
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reaper);

        info!(
            endpoint = %inner.connector.endpoint(),
            max_connections = inner.config.max_connections,
            "Connection pool created"
        );
        Ok(Self { inner })
    }

    /// Get the pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Endpoint description from the connector
    pub fn endpoint(&self) -> String {
        self.inner.connector.endpoint()
    }

    /// Acquire a connection, waiting up to the configured acquire timeout
    pub async fn acquire(&self) -> PoolResult<PooledConnection> {
        self.acquire_timeout(self.inner.config.acquire_timeout).await
    }

    /// Acquire a connection, waiting up to `timeout` for one to free up
    ///
    /// Resolution order: a healthy idle connection, then a new connection if
    /// under capacity, then a FIFO wait for a release.
    pub async fn acquire_timeout(&self, timeout: Duration) -> PoolResult<PooledConnection> {
        let deadline = Instant::now() + timeout;
        let (step, dead) = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            let dead = state.take_dead_idle();

            let idle = state
                .slots
                .iter()
                .position(|slot| slot.state == ConnectionState::Idle);
            let step = if let Some(index) = idle {
                let slot = &mut state.slots[index];
                slot.state = ConnectionState::InUse;
                slot.last_used = Instant::now();
                AcquireStep::Ready(slot.id, Arc::clone(&slot.session))
            } else if state.capacity_used() < self.inner.config.max_connections {
                state.connecting += 1;
                AcquireStep::Connect
            } else {
                let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(Waiter { ticket, tx });
                AcquireStep::Wait(ticket, rx)
            };
            (step, dead)
        };

        for session in dead {
            self.inner.metrics.connection_evicted();
            close_detached(session);
        }

        let conn = match step {
            AcquireStep::Ready(id, session) => {
                debug!(connection_id = %id, "Reusing idle connection");
                self.lease(id, session)
            }
            AcquireStep::Connect => self.establish(self.reservation()).await?,
            AcquireStep::Wait(ticket, rx) => {
                debug!(ticket, "Pool at capacity, queueing acquire");
                let pending = PendingAcquire {
                    inner: Arc::clone(&self.inner),
                    ticket,
                    rx,
                    settled: false,
                };
                match pending.wait(deadline, timeout).await {
                    Ok(Grant::Connection(id, session)) => self.lease(id, session),
                    Ok(Grant::Vacancy) => {
                        // The caller's deadline still applies to the connect
                        let connect = self.establish(self.reservation());
                        match tokio::time::timeout_at(deadline, connect).await {
                            Ok(result) => result?,
                            Err(_) => {
                                self.inner.metrics.acquire_timed_out();
                                warn!(?timeout, "Timed out connecting into a freed slot");
                                return Err(PoolError::AcquireTimeout { waited: timeout });
                            }
                        }
                    }
                    Err(e) => {
                        if matches!(e, PoolError::AcquireTimeout { .. }) {
                            self.inner.metrics.acquire_timed_out();
                            warn!(?timeout, "Timed out waiting for a connection");
                        }
                        return Err(e);
                    }
                }
            }
        };

        self.inner.metrics.acquired();
        Ok(conn)
    }

    /// Return a lease to the pool
    ///
    /// Equivalent to dropping it; provided for callers that want the release
    /// to read explicitly.
    pub fn release(&self, conn: PooledConnection) {
        if !Arc::ptr_eq(&conn.pool, &self.inner) {
            warn!(connection_id = %conn.id, "Released connection belongs to a different pool");
        }
        drop(conn);
    }

    fn reservation(&self) -> Reservation {
        Reservation {
            inner: Arc::clone(&self.inner),
            active: true,
        }
    }

    fn lease(&self, id: ConnectionId, session: Arc<dyn RemoteSession>) -> PooledConnection {
        PooledConnection {
            pool: Arc::clone(&self.inner),
            id,
            session,
            broken: AtomicBool::new(false),
        }
    }

    async fn establish(&self, reservation: Reservation) -> PoolResult<PooledConnection> {
        let endpoint = self.inner.connector.endpoint();
        let timeout = self.inner.config.connect_timeout;

        let session = match tokio::time::timeout(timeout, self.inner.connector.connect()).await {
            Ok(Ok(session)) => session,
            Ok(Err(source)) => {
                self.inner.metrics.connect_failed();
                warn!(%endpoint, error = %source, "Failed to establish connection");
                return Err(PoolError::Connect { endpoint, source });
            }
            Err(_) => {
                self.inner.metrics.connect_failed();
                warn!(%endpoint, ?timeout, "Connection attempt timed out");
                return Err(PoolError::ConnectTimeout { endpoint, timeout });
            }
        };

        let id = ConnectionId::new();
        if let Err(e) = reservation.fulfil(id, &session) {
            session.close().await;
            return Err(e);
        }

        self.inner.metrics.connection_created();
        info!(connection_id = %id, %endpoint, "New connection established");
        Ok(self.lease(id, session))
    }

    /// Run a command to completion without a PTY and collect its output
    ///
    /// On timeout the command is terminated and the call fails; the lease
    /// stays with the caller, who releases it as usual. If the command does
    /// not stop, the lease is marked broken.
    pub async fn exec(
        &self,
        conn: &PooledConnection,
        command: &str,
        options: ExecOptions,
    ) -> PoolResult<ExecOutput> {
        let timeout = options.timeout.unwrap_or(self.inner.config.exec_timeout);
        let command_line = match &options.cwd {
            Some(cwd) => format!(
                "cd {} && {}",
                shell_escape::unix::escape(cwd.as_str().into()),
                command
            ),
            None => command.to_string(),
        };

        let deadline = Instant::now() + timeout;

        let spawn = conn.spawn(&command_line, None);
        let mut process = match tokio::time::timeout_at(deadline, spawn).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(connection_id = %conn.id, ?timeout, "Timed out starting command");
                conn.mark_broken();
                return Err(PoolError::ExecTimeout { timeout });
            }
        };

        let collect = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut exit_code = None;

            while let Some(item) = process.next_output().await {
                match item {
                    Ok(ProcessOutput::Stdout(bytes)) => stdout.extend_from_slice(&bytes),
                    Ok(ProcessOutput::Stderr(bytes)) => stderr.extend_from_slice(&bytes),
                    Ok(ProcessOutput::Exit(code)) => exit_code = Some(code),
                    Err(TransportError::ChannelClosed(reason)) => {
                        debug!(%reason, "Channel closed without exit status");
                        break;
                    }
                    Err(e) => {
                        if e.is_fatal_to_session() {
                            conn.mark_broken();
                        }
                        return Err(PoolError::Transport(e));
                    }
                }
            }

            Ok(ExecOutput {
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                exit_code,
            })
        };

        match tokio::time::timeout_at(deadline, collect).await {
            Ok(result) => result,
            Err(_) => {
                warn!(connection_id = %conn.id, ?timeout, "Command timed out");
                stop_timed_out(process.as_mut(), conn).await;
                Err(PoolError::ExecTimeout { timeout })
            }
        }
    }

    /// Acquire a connection and run a trivial command on it
    pub async fn test_connection(&self) -> bool {
        let conn = match self.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Connection test could not acquire a connection");
                return false;
            }
        };

        match self.exec(&conn, "echo ptygate", ExecOptions::default()).await {
            Ok(output) => output.success(),
            Err(e) => {
                warn!(error = %e, "Connection test command failed");
                false
            }
        }
    }

    /// Close idle connections past the idle timeout now
    ///
    /// The background reaper calls this on every tick.
    pub async fn reap_idle(&self) -> usize {
        self.inner.reap_idle().await
    }

    /// Per-connection view of the pool
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let state = self.inner.lock();
        let now = Instant::now();
        state
            .slots
            .iter()
            .map(|slot| ConnectionInfo {
                id: slot.id.to_string(),
                state: slot.state,
                idle_for_ms: u64::try_from(now.duration_since(slot.last_used).as_millis())
                    .unwrap_or(u64::MAX),
            })
            .collect()
    }

    /// Current counts and cumulative metrics
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        let idle = state
            .slots
            .iter()
            .filter(|slot| slot.state == ConnectionState::Idle)
            .count();

        PoolStats {
            max_connections: self.inner.config.max_connections,
            total: state.slots.len(),
            idle,
            in_use: state.slots.len() - idle,
            connecting: state.connecting,
            waiting: state.waiters.len(),
            closed: state.closed,
            metrics: self.inner.metrics.snapshot(),
        }
    }

    /// Shut the pool down
    ///
    /// Queued acquirers fail with `Closed`, every session is closed and the
    /// reaper stops. Leases still held are closed underneath their holders.
    pub async fn destroy(&self) {
        let sessions: Vec<_> = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            // Dropping the senders wakes every waiter with a closed channel
            state.waiters.clear();
            state.slots.drain(..).map(|slot| slot.session).collect()
        };

        if let Some(reaper) = self
            .inner
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reaper.abort();
        }

        let count = sessions.len();
        for session in sessions {
            session.close().await;
        }
        info!(closed_connections = count, "Connection pool destroyed");
    }
}
