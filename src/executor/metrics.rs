//! Execution counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Executor metrics for monitoring.
#[derive(Debug, Default)]
pub struct ExecutorMetrics {
    pub queries_received: AtomicU64,
    pub queries_rejected: AtomicU64,
    pub queries_executed: AtomicU64,
    pub query_errors: AtomicU64,
    pub timeouts: AtomicU64,
    pub rows_truncated: AtomicU64,
}

impl ExecutorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query_received(&self) {
        self.queries_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query_rejected(&self) {
        self.queries_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query_executed(&self) {
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query_error(&self) {
        self.query_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_truncated(&self) {
        self.rows_truncated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ExecutorMetricsSnapshot {
        ExecutorMetricsSnapshot {
            queries_received: self.queries_received.load(Ordering::Relaxed),
            queries_rejected: self.queries_rejected.load(Ordering::Relaxed),
            queries_executed: self.queries_executed.load(Ordering::Relaxed),
            query_errors: self.query_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            rows_truncated: self.rows_truncated.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of executor metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecutorMetricsSnapshot {
    pub queries_received: u64,
    pub queries_rejected: u64,
    /// Statements that reached the store; cache hits are not counted.
    pub queries_executed: u64,
    pub query_errors: u64,
    pub timeouts: u64,
    pub rows_truncated: u64,
}
