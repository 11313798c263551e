//! Observability counters
//!
//! Plain atomics; snapshots feed SHOW-style introspection and the monitor
//! plugin capability.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters.
#[derive(Debug, Default)]
pub struct Metrics {
    pub queries_executed: AtomicU64,
    pub rows_returned: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub sessions_opened: AtomicU64,
    pub active_sessions: AtomicU64,
    pub txns_committed: AtomicU64,
    pub txns_aborted: AtomicU64,
    pub plans_optimized: AtomicU64,
    pub fts_searches: AtomicU64,
    pub remote_requests: AtomicU64,
    pub remote_retries: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time snapshot of every counter.
    pub fn snapshot(&self) -> HashMap<&'static str, u64> {
        let mut out = HashMap::new();
        out.insert("queries_executed", self.queries_executed.load(Ordering::Relaxed));
        out.insert("rows_returned", self.rows_returned.load(Ordering::Relaxed));
        out.insert("cache_hits", self.cache_hits.load(Ordering::Relaxed));
        out.insert("cache_misses", self.cache_misses.load(Ordering::Relaxed));
        out.insert("sessions_opened", self.sessions_opened.load(Ordering::Relaxed));
        out.insert("active_sessions", self.active_sessions.load(Ordering::Relaxed));
        out.insert("txns_committed", self.txns_committed.load(Ordering::Relaxed));
        out.insert("txns_aborted", self.txns_aborted.load(Ordering::Relaxed));
        out.insert("plans_optimized", self.plans_optimized.load(Ordering::Relaxed));
        out.insert("fts_searches", self.fts_searches.load(Ordering::Relaxed));
        out.insert("remote_requests", self.remote_requests.load(Ordering::Relaxed));
        out.insert("remote_retries", self.remote_retries.load(Ordering::Relaxed));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = Metrics::new();
        metrics.queries_executed.fetch_add(3, Ordering::Relaxed);
        metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
        let snap = metrics.snapshot();
        assert_eq!(snap["queries_executed"], 3);
        assert_eq!(snap["cache_hits"], 1);
        assert_eq!(snap["rows_returned"], 0);
    }
}
