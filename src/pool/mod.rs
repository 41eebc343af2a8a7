// ABOUTME: Remote connection pooling for the execution gateway
//
// Keeps a bounded set of authenticated sessions to one remote host so each
// request does not pay for a fresh SSH handshake.
//
// Key components:
// - config: endpoint, credentials, capacity and timeouts
// - connection_pool: acquire/release with FIFO waiters, idle reaper, exec
// - metrics: cumulative counters for observability

pub mod config;
pub mod connection_pool;
pub mod metrics;

// Re-exports for convenient access
pub use config::{Credentials, EndpointConfig, KeepaliveConfig, PoolConfig};
pub use connection_pool::{
    ConnectionInfo, ConnectionPool, ConnectionState, ExecOptions, ExecOutput, PoolError,
    PoolResult, PoolStats, PooledConnection,
};
pub use metrics::{PoolMetrics, PoolMetricsSnapshot};
