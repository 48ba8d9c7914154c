//! Metrics collection for monitoring bracket reconciliation

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Collected metrics for the bracket manager
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Private events handed to the manager
    pub events_processed: u64,
    /// Events that failed to decode
    pub events_malformed: u64,
    /// Fills on tracked orders
    pub entry_fills: u64,
    pub exit_fills: u64,
    /// Gateway actions issued by the reconciler
    pub cancels_issued: u64,
    pub legs_resized: u64,
    /// Groups that reached a terminal state
    pub groups_resolved: u64,
    /// Failures
    pub gateway_errors: u64,
    pub persist_failures: u64,
    /// WebSocket status
    pub private_ws_reconnects: u64,
}

/// Thread-safe metrics collector
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    events_processed: AtomicU64,
    events_malformed: AtomicU64,
    entry_fills: AtomicU64,
    exit_fills: AtomicU64,
    cancels_issued: AtomicU64,
    legs_resized: AtomicU64,
    groups_resolved: AtomicU64,
    gateway_errors: AtomicU64,
    persist_failures: AtomicU64,
    private_ws_reconnects: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_events_processed(&self) {
        self.inner.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_events_malformed(&self) {
        self.inner.events_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_entry_fills(&self) {
        self.inner.entry_fills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_exit_fills(&self) {
        self.inner.exit_fills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cancels_issued(&self) {
        self.inner.cancels_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_legs_resized(&self) {
        self.inner.legs_resized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_groups_resolved(&self) {
        self.inner.groups_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_gateway_errors(&self) {
        self.inner.gateway_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_persist_failures(&self) {
        self.inner.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_private_ws_reconnects(&self) {
        self.inner.private_ws_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_processed: self.inner.events_processed.load(Ordering::Relaxed),
            events_malformed: self.inner.events_malformed.load(Ordering::Relaxed),
            entry_fills: self.inner.entry_fills.load(Ordering::Relaxed),
            exit_fills: self.inner.exit_fills.load(Ordering::Relaxed),
            cancels_issued: self.inner.cancels_issued.load(Ordering::Relaxed),
            legs_resized: self.inner.legs_resized.load(Ordering::Relaxed),
            groups_resolved: self.inner.groups_resolved.load(Ordering::Relaxed),
            gateway_errors: self.inner.gateway_errors.load(Ordering::Relaxed),
            persist_failures: self.inner.persist_failures.load(Ordering::Relaxed),
            private_ws_reconnects: self.inner.private_ws_reconnects.load(Ordering::Relaxed),
        }
    }
}
