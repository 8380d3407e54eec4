//! Process-wide relay counters.
//!
//! Sessions only ever bump counters here; no session data is shared.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::reporter::ErrorReporter;

#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
    accept_errors: AtomicU64,
    active: AtomicU64,
    dial_failures: AtomicU64,
    relay_errors: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    bytes_upstream: AtomicU64,
    bytes_downstream: AtomicU64,
    reporter: Option<Arc<dyn ErrorReporter>>,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub accept_errors: u64,
    pub active: u64,
    pub dial_failures: u64,
    pub relay_errors: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub bytes_upstream: u64,
    pub bytes_downstream: u64,
    /// Reports the error reporter dropped because its queue was full.
    pub reports_dropped: u64,
}

impl ServerStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Counters that also surface `reporter`'s drop count.
    pub fn with_reporter(reporter: Arc<dyn ErrorReporter>) -> Arc<Self> {
        Arc::new(Self {
            reporter: Some(reporter),
            ..Self::default()
        })
    }

    pub fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay_error(&self) {
        self.relay_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, upstream: u64, downstream: u64) {
        self.bytes_upstream.fetch_add(upstream, Ordering::Relaxed);
        self.bytes_downstream.fetch_add(downstream, Ordering::Relaxed);
    }

    /// Count a session as active until the returned guard is dropped.
    pub fn track_active(self: &Arc<Self>) -> ActiveSession {
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveSession {
            stats: Arc::clone(self),
        }
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            relay_errors: self.relay_errors.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            bytes_upstream: self.bytes_upstream.load(Ordering::Relaxed),
            bytes_downstream: self.bytes_downstream.load(Ordering::Relaxed),
            reports_dropped: self.reporter.as_ref().map_or(0, |r| r.dropped()),
        }
    }
}

#[derive(Debug)]
pub struct ActiveSession {
    stats: Arc<ServerStats>,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}
