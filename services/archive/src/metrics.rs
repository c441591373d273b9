//! Archive metrics
//!
//! Every update goes to the `metrics` facade (exported to Prometheus by the
//! binary) and to per-tenant atomic counters, which back snapshots for the
//! stats endpoint and for tests. Recording never blocks.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const FLUSH_DURATION_MICROS: &str = "archive.flush.duration_micros";
pub const PER_MESSAGE_FLUSH_MICROS: &str = "archive.flush.per_message_micros";
pub const MESSAGES_DROPPED_OVERLOAD: &str = "archive.messages.dropped_overload";
pub const MESSAGES_DROPPED_INSERT_FAILURE: &str = "archive.messages.dropped_insert_failure";
pub const MESSAGES_FLUSHED: &str = "archive.messages.flushed";

/// Counters for one tenant's archive pool
#[derive(Debug)]
pub struct ArchiveMetrics {
    tenant: String,
    flushes: AtomicU64,
    messages_flushed: AtomicU64,
    flush_micros_total: AtomicU64,
    dropped_overload: AtomicU64,
    dropped_insert_failure: AtomicU64,
    stale_timer_signals: AtomicU64,
}

impl ArchiveMetrics {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            flushes: AtomicU64::new(0),
            messages_flushed: AtomicU64::new(0),
            flush_micros_total: AtomicU64::new(0),
            dropped_overload: AtomicU64::new(0),
            dropped_insert_failure: AtomicU64::new(0),
            stale_timer_signals: AtomicU64::new(0),
        }
    }

    /// Record the wall-clock time of one flush of `count` records
    pub fn record_flush(&self, elapsed: Duration, count: usize) {
        let micros = elapsed.as_micros() as u64;

        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.flush_micros_total.fetch_add(micros, Ordering::Relaxed);

        ::metrics::histogram!(FLUSH_DURATION_MICROS, "tenant" => self.tenant.clone())
            .record(micros as f64);

        if count > 0 {
            ::metrics::histogram!(PER_MESSAGE_FLUSH_MICROS, "tenant" => self.tenant.clone())
                .record(micros as f64 / count as f64);
        }
    }

    /// Record records that reached the store
    pub fn record_flushed(&self, count: usize) {
        self.messages_flushed
            .fetch_add(count as u64, Ordering::Relaxed);
        ::metrics::counter!(MESSAGES_FLUSHED, "tenant" => self.tenant.clone())
            .increment(count as u64);
    }

    /// Record a record rejected at admission
    pub fn record_dropped_overload(&self) {
        self.dropped_overload.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!(MESSAGES_DROPPED_OVERLOAD, "tenant" => self.tenant.clone())
            .increment(1);
    }

    /// Record a batch lost to a failed insert
    pub fn record_dropped_insert_failure(&self, count: usize) {
        self.dropped_insert_failure
            .fetch_add(count as u64, Ordering::Relaxed);
        ::metrics::counter!(MESSAGES_DROPPED_INSERT_FAILURE, "tenant" => self.tenant.clone())
            .increment(count as u64);
    }

    pub fn record_stale_timer(&self) {
        self.stale_timer_signals.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            flushes: self.flushes.load(Ordering::Relaxed),
            messages_flushed: self.messages_flushed.load(Ordering::Relaxed),
            flush_micros_total: self.flush_micros_total.load(Ordering::Relaxed),
            dropped_overload: self.dropped_overload.load(Ordering::Relaxed),
            dropped_insert_failure: self.dropped_insert_failure.load(Ordering::Relaxed),
            stale_timer_signals: self.stale_timer_signals.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub flushes: u64,
    pub messages_flushed: u64,
    pub flush_micros_total: u64,
    pub dropped_overload: u64,
    pub dropped_insert_failure: u64,
    pub stale_timer_signals: u64,
}
