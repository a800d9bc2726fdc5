//! Registry-owned call metrics.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Snapshot of registry metrics at a point in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryMetricsSnapshot {
    /// Calls accepted since startup.
    pub calls_accepted: u64,
    /// Calls that reached their terminal state since startup.
    pub calls_finished: u64,
    /// Server streams currently open.
    pub open_streams: i64,
    /// Server streams opened since startup.
    pub streams_opened_total: u64,
}

/// Thread-safe call counters owned by the service registry.
#[derive(Default)]
pub struct RegistryMetrics {
    calls_accepted: AtomicU64,
    calls_finished: AtomicU64,
    open_streams: AtomicI64,
    streams_opened_total: AtomicU64,
}

impl std::fmt::Debug for RegistryMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl RegistryMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc_accepted(&self) {
        self.calls_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_finished(&self) {
        self.calls_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stream_opened(&self) {
        self.open_streams.fetch_add(1, Ordering::Relaxed);
        self.streams_opened_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stream_closed(&self) {
        self.open_streams.fetch_sub(1, Ordering::Relaxed);
    }

    /// Returns a consistent-enough snapshot of the counters.
    pub fn snapshot(&self) -> RegistryMetricsSnapshot {
        RegistryMetricsSnapshot {
            calls_accepted: self.calls_accepted.load(Ordering::Relaxed),
            calls_finished: self.calls_finished.load(Ordering::Relaxed),
            open_streams: self.open_streams.load(Ordering::Relaxed),
            streams_opened_total: self.streams_opened_total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = RegistryMetrics::new();
        metrics.inc_accepted();
        metrics.inc_accepted();
        metrics.inc_finished();
        metrics.stream_opened();
        metrics.stream_opened();
        metrics.stream_closed();
        let snap = metrics.snapshot();
        assert_eq!(snap.calls_accepted, 2);
        assert_eq!(snap.calls_finished, 1);
        assert_eq!(snap.open_streams, 1);
        assert_eq!(snap.streams_opened_total, 2);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = RegistryMetrics::new();
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("open_streams"));
    }
}
