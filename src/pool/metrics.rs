// ABOUTME: Metrics and observability for the connection pool
//
// Tracks:
// - Acquires: total, served from idle, timeouts
// - Connections: created, failed to establish, evicted, reaped

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative pool counters
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub acquires_total: AtomicU64,
    pub acquire_timeouts: AtomicU64,
    pub connections_created: AtomicU64,
    pub connect_failures: AtomicU64,
    pub connections_evicted: AtomicU64,
    pub connections_reaped: AtomicU64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquired(&self) {
        self.acquires_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn acquire_timed_out(&self) {
        self.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_evicted(&self) {
        self.connections_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connections_reaped(&self, count: usize) {
        self.connections_reaped.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            acquires_total: self.acquires_total.load(Ordering::Relaxed),
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            connections_evicted: self.connections_evicted.load(Ordering::Relaxed),
            connections_reaped: self.connections_reaped.load(Ordering::Relaxed),
        }
    }
}

/// Serializable view of [`PoolMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolMetricsSnapshot {
    pub acquires_total: u64,
    pub acquire_timeouts: u64,
    pub connections_created: u64,
    pub connect_failures: u64,
    pub connections_evicted: u64,
    pub connections_reaped: u64,
}
