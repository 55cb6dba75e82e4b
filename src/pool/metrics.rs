//! Pool counters for monitoring.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub connections_created: AtomicU64,
    pub connections_closed: AtomicU64,
    pub connection_errors: AtomicU64,
    pub acquisitions: AtomicU64,
    pub releases: AtomicU64,
    pub acquire_timeouts: AtomicU64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquisition(&self) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquire_timeout(&self) {
        self.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pool metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolMetricsSnapshot {
    pub connections_created: u64,
    pub connections_closed: u64,
    pub connection_errors: u64,
    pub acquisitions: u64,
    pub releases: u64,
    pub acquire_timeouts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_metrics() {
        let metrics = PoolMetrics::new();
        metrics.record_connection_created();
        metrics.record_acquisition();
        metrics.record_acquisition();
        metrics.record_acquire_timeout();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_created, 1);
        assert_eq!(snapshot.acquisitions, 2);
        assert_eq!(snapshot.acquire_timeouts, 1);
        assert_eq!(snapshot.releases, 0);
    }
}
