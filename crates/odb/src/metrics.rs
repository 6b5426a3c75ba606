//! Lock-free operation counters plus a rolling per-operation latency
//! window, mirroring the storage server's own `metrics` module.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Queries slower than this are logged individually as "slow".
pub const SLOW_QUERY_THRESHOLD_MS: u64 = 250;

/// How many recent latency samples are kept per operation for percentile
/// computation.
const LATENCY_WINDOW_SIZE: usize = 1024;

#[derive(Default)]
struct OperationCounters {
    calls: AtomicU64,
    errors: AtomicU64,
    total_latency_ms: AtomicU64,
}

struct LatencyWindow {
    samples: Mutex<VecDeque<u64>>,
}

impl Default for LatencyWindow {
    fn default() -> Self {
        LatencyWindow {
            samples: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW_SIZE)),
        }
    }
}

impl LatencyWindow {
    fn record(&self, ms: u64) {
        let mut samples = self.samples.lock().unwrap();
        if samples.len() == LATENCY_WINDOW_SIZE {
            samples.pop_front();
        }
        samples.push_back(ms);
    }

    fn percentiles(&self) -> (u64, u64, u64) {
        let mut samples: Vec<u64> = self.samples.lock().unwrap().iter().copied().collect();
        if samples.is_empty() {
            return (0, 0, 0);
        }
        samples.sort_unstable();
        let at = |p: f64| -> u64 {
            let idx = ((samples.len() as f64 - 1.0) * p).round() as usize;
            samples[idx.min(samples.len() - 1)]
        };
        (at(0.50), at(0.95), at(0.99))
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct OperationStat {
    pub operation: String,
    pub calls: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub operations: Vec<OperationStat>,
    pub active_sessions: u64,
    pub active_watch_subscribers: u64,
}

struct OperationEntry {
    counters: OperationCounters,
    latencies: LatencyWindow,
}

impl Default for OperationEntry {
    fn default() -> Self {
        OperationEntry {
            counters: OperationCounters::default(),
            latencies: LatencyWindow::default(),
        }
    }
}

/// Process-wide metrics collector. Cheap to call from every RPC handler:
/// all mutation is through atomics or a short-lived mutex on the latency
/// window, never the hot path's request/response round trip itself.
pub struct Metrics {
    operations: Mutex<std::collections::HashMap<String, std::sync::Arc<OperationEntry>>>,
    active_sessions: AtomicU64,
    active_watch_subscribers: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            operations: Mutex::new(std::collections::HashMap::new()),
            active_sessions: AtomicU64::new(0),
            active_watch_subscribers: AtomicU64::new(0),
        }
    }

    fn entry(&self, operation: &str) -> std::sync::Arc<OperationEntry> {
        let mut ops = self.operations.lock().unwrap();
        ops.entry(operation.to_string())
            .or_insert_with(|| std::sync::Arc::new(OperationEntry::default()))
            .clone()
    }

    pub fn record_call(&self, operation: &str, elapsed: Duration, is_error: bool) {
        let entry = self.entry(operation);
        let ms = elapsed.as_millis() as u64;
        entry.counters.calls.fetch_add(1, Ordering::Relaxed);
        if is_error {
            entry.counters.errors.fetch_add(1, Ordering::Relaxed);
        }
        entry.counters.total_latency_ms.fetch_add(ms, Ordering::Relaxed);
        entry.latencies.record(ms);

        if ms >= SLOW_QUERY_THRESHOLD_MS {
            tracing::warn!(operation, ms, "slow operation");
        }
    }

    pub fn session_opened(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn watch_subscriber_added(&self) {
        self.active_watch_subscribers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn watch_subscriber_removed(&self) {
        self.active_watch_subscribers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let ops = self.operations.lock().unwrap();
        let operations = ops
            .iter()
            .map(|(name, entry)| {
                let calls = entry.counters.calls.load(Ordering::Relaxed);
                let errors = entry.counters.errors.load(Ordering::Relaxed);
                let total = entry.counters.total_latency_ms.load(Ordering::Relaxed);
                let (p50, p95, p99) = entry.latencies.percentiles();
                OperationStat {
                    operation: name.clone(),
                    calls,
                    errors,
                    avg_latency_ms: if calls == 0 { 0.0 } else { total as f64 / calls as f64 },
                    p50_ms: p50,
                    p95_ms: p95,
                    p99_ms: p99,
                }
            })
            .collect();
        MetricsSnapshot {
            operations,
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            active_watch_subscribers: self.active_watch_subscribers.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_calls_and_computes_average() {
        let m = Metrics::new();
        m.record_call("get", Duration::from_millis(10), false);
        m.record_call("get", Duration::from_millis(20), true);
        let snap = m.snapshot();
        let get = snap.operations.iter().find(|o| o.operation == "get").unwrap();
        assert_eq!(get.calls, 2);
        assert_eq!(get.errors, 1);
        assert_eq!(get.avg_latency_ms, 15.0);
    }

    #[test]
    fn session_counters_track_open_close() {
        let m = Metrics::new();
        m.session_opened();
        m.session_opened();
        m.session_closed();
        assert_eq!(m.snapshot().active_sessions, 1);
    }
}
