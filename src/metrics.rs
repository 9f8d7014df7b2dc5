//! Instrumentation for the servlet adapter.
//!
//! All instruments use atomic operations for thread-safe updates without
//! locks, except labeled counters which keep their label table behind a
//! mutex. A process-wide [`ServletMetrics`] registry is available through
//! [`ServletMetrics::global`] and can be rendered in Prometheus text format
//! for scraping.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Monotonic event counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, amount: u64) {
        self.0.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Up/down gauge, used for the number of currently active tasks.
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Cumulative duration statistic: observation count, total time, and maximum.
///
/// The average is derived the same way the request latency gauge derives it:
/// total divided by count, zero when nothing has been recorded yet.
#[derive(Debug, Default)]
pub struct DurationStat {
    count: AtomicU64,
    total_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl DurationStat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, elapsed: Duration) {
        let ns = elapsed.as_nanos() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> Duration {
        Duration::from_nanos(self.total_ns.load(Ordering::Relaxed))
    }

    pub fn max(&self) -> Duration {
        Duration::from_nanos(self.max_ns.load(Ordering::Relaxed))
    }

    pub fn average(&self) -> Duration {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            Duration::from_nanos(0)
        } else {
            Duration::from_nanos(self.total_ns.load(Ordering::Relaxed) / count)
        }
    }
}

/// Counter family keyed by a string label, used for per-method and
/// per-status counts. Labels are created lazily on first increment.
#[derive(Debug, Default)]
pub struct LabeledCounter {
    counts: Mutex<HashMap<String, u64>>,
}

impl LabeledCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, label: &str) {
        let mut counts = self.counts.lock().unwrap();
        *counts.entry(label.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, label: &str) -> u64 {
        self.counts.lock().unwrap().get(label).copied().unwrap_or(0)
    }

    /// Sorted snapshot of all labels seen so far.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let counts = self.counts.lock().unwrap();
        let mut entries: Vec<_> = counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
        entries.sort();
        entries
    }
}

/// HTTP methods that get their own counter label; everything else is
/// bucketed under `OTHER`.
const COUNTED_METHODS: [&str; 7] = ["GET", "HEAD", "OPTIONS", "POST", "PUT", "DELETE", "PATCH"];

/// Instrument bundle emitted by servlet tasks.
///
/// Fields are public so that tasks can increment them directly and tests can
/// assert on them; the bundle itself carries no behavior beyond rendering.
#[derive(Debug, Default)]
pub struct ServletMetrics {
    /// Tasks currently between start and completion.
    pub active_tasks: Gauge,
    /// Wall-clock time from task start to async transaction completion.
    pub task_duration: DurationStat,
    pub request_reads: Counter,
    pub request_bytes: Counter,
    pub request_waits: Counter,
    pub response_writes: Counter,
    pub response_bytes: Counter,
    pub response_waits: Counter,
    /// Failures thrown by container-provided I/O inside guarded blocks.
    pub exceptions_container: Counter,
    /// Asynchronous error events reported by the container.
    pub exceptions_async: Counter,
    /// Application failures observed through the reactive future.
    pub exceptions_service: Counter,
    /// Timeout events reported by the container.
    pub exceptions_timeout: Counter,
    /// Requests by HTTP method label.
    pub methods: LabeledCounter,
    /// Responses by status code label.
    pub statuses: LabeledCounter,
}

static GLOBAL: Lazy<Arc<ServletMetrics>> = Lazy::new(|| Arc::new(ServletMetrics::new()));

impl ServletMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry used by tasks unless one is supplied explicitly.
    pub fn global() -> Arc<ServletMetrics> {
        Arc::clone(&GLOBAL)
    }

    pub fn record_method(&self, method: &str) {
        self.methods.increment(method_label(method));
    }

    pub fn record_status(&self, status: u16) {
        self.statuses.increment(&status_label(status));
    }

    /// Render all instruments in Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "# HELP reservlet_active_tasks Servlet tasks currently in flight\n\
             # TYPE reservlet_active_tasks gauge\n\
             reservlet_active_tasks {}",
            self.active_tasks.get()
        );
        let _ = writeln!(
            out,
            "# HELP reservlet_task_duration_seconds Task wall-clock duration\n\
             # TYPE reservlet_task_duration_seconds summary\n\
             reservlet_task_duration_seconds_count {}\n\
             reservlet_task_duration_seconds_sum {}\n\
             reservlet_task_duration_seconds_max {}",
            self.task_duration.count(),
            self.task_duration.total().as_secs_f64(),
            self.task_duration.max().as_secs_f64()
        );
        for (name, counter) in [
            ("request_reads", &self.request_reads),
            ("request_bytes", &self.request_bytes),
            ("request_waits", &self.request_waits),
            ("response_writes", &self.response_writes),
            ("response_bytes", &self.response_bytes),
            ("response_waits", &self.response_waits),
            ("exceptions_container", &self.exceptions_container),
            ("exceptions_async", &self.exceptions_async),
            ("exceptions_service", &self.exceptions_service),
            ("exceptions_timeout", &self.exceptions_timeout),
        ] {
            let _ = writeln!(out, "reservlet_{}_total {}", name, counter.get());
        }
        for (label, count) in self.methods.snapshot() {
            let _ = writeln!(out, "reservlet_method_total{{method=\"{label}\"}} {count}");
        }
        for (label, count) in self.statuses.snapshot() {
            let _ = writeln!(out, "reservlet_status_total{{status=\"{label}\"}} {count}");
        }
        out
    }
}

fn method_label(method: &str) -> &'static str {
    COUNTED_METHODS
        .iter()
        .find(|counted| method == **counted)
        .copied()
        .unwrap_or("OTHER")
}

fn status_label(status: u16) -> String {
    if (100..600).contains(&status) {
        status.to_string()
    } else {
        "other".to_string()
    }
}
