//! Error reporting for the relay.
//!
//! Components never log diagnostics through ambient state; each one is handed
//! an [`ErrorReporter`] when it is constructed. Reporting never blocks and never
//! fails the caller.
//!
//! Two implementations are provided:
//! - [`TracingReporter`] forwards each message straight to `tracing`.
//! - [`QueuedReporter`] pushes onto a fixed-capacity queue drained by a single
//!   background task. A full queue drops the message and bumps a counter
//!   instead of stalling the producer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warn,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warn => write!(f, "warn"),
            Severity::Info => write!(f, "info"),
        }
    }
}

/// A single diagnostic line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub severity: Severity,
    pub message: String,
}

impl Report {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
        }
    }
}

pub trait ErrorReporter: Send + Sync + fmt::Debug {
    /// Hand a message to the sink. Must return promptly.
    fn report(&self, severity: Severity, message: String);

    fn error(&self, message: String) {
        self.report(Severity::Error, message);
    }

    fn warn(&self, message: String) {
        self.report(Severity::Warn, message);
    }

    fn info(&self, message: String) {
        self.report(Severity::Info, message);
    }

    /// Messages this reporter discarded instead of blocking.
    fn dropped(&self) -> u64 {
        0
    }
}

fn emit(report: &Report) {
    match report.severity {
        Severity::Error => error!(target: "tcp_relay::report", "{}", report.message),
        Severity::Warn => warn!(target: "tcp_relay::report", "{}", report.message),
        Severity::Info => info!(target: "tcp_relay::report", "{}", report.message),
    }
}

/// Reports synchronously through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, severity: Severity, message: String) {
        emit(&Report { severity, message });
    }
}

#[derive(Debug, Default)]
struct QueueCounters {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Bounded, non-blocking reporter backed by an mpsc queue.
#[derive(Debug, Clone)]
pub struct QueuedReporter {
    tx: mpsc::Sender<Report>,
    counters: Arc<QueueCounters>,
}

/// Owns the drain task of a [`QueuedReporter`].
#[derive(Debug)]
pub struct ReporterWorker {
    handle: JoinHandle<()>,
    counters: Arc<QueueCounters>,
}

impl QueuedReporter {
    /// Spawn a reporter whose drain task emits through `tracing`.
    pub fn spawn(capacity: usize) -> (Self, ReporterWorker) {
        Self::spawn_with_sink(capacity, |report| emit(&report))
    }

    /// Spawn a reporter that drains into `sink`. A capacity of zero is treated as one.
    pub fn spawn_with_sink<F>(capacity: usize, mut sink: F) -> (Self, ReporterWorker)
    where
        F: FnMut(Report) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Report>(capacity.max(1));
        let counters = Arc::new(QueueCounters::default());

        let worker_counters = Arc::clone(&counters);
        let handle = tokio::spawn(async move {
            while let Some(report) = rx.recv().await {
                sink(report);
                worker_counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
        });

        (
            Self {
                tx,
                counters: Arc::clone(&counters),
            },
            ReporterWorker { handle, counters },
        )
    }

    /// Messages discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Messages the drain task has written to its sink.
    pub fn delivered(&self) -> u64 {
        self.counters.delivered.load(Ordering::Relaxed)
    }
}

impl ErrorReporter for QueuedReporter {
    fn report(&self, severity: Severity, message: String) {
        match self.tx.try_send(Report { severity, message }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let previous = self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                if previous == 0 {
                    warn!("report queue full, dropping messages");
                }
            }
            // Drain task is gone; nothing left to deliver to.
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn dropped(&self) -> u64 {
        QueuedReporter::dropped(self)
    }
}

impl ReporterWorker {
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Wait for the queue to drain. Completes once every `QueuedReporter`
    /// clone has been dropped and the remaining messages are written.
    pub async fn finish(self) {
        if let Err(e) = self.handle.await {
            error!("report drain task failed: {}", e);
        }
        let dropped = self.counters.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            warn!("{} report(s) were dropped while the queue was full", dropped);
        }
    }
}

/// Pick a reporter for the given queue capacity. Zero selects [`TracingReporter`].
pub fn build(capacity: usize) -> (Arc<dyn ErrorReporter>, Option<ReporterWorker>) {
    if capacity == 0 {
        return (Arc::new(TracingReporter), None);
    }
    let (reporter, worker) = QueuedReporter::spawn(capacity);
    (Arc::new(reporter), Some(worker))
}
