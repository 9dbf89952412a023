//! Per-cache counters.
//!
//! Every [`NamedCache`](crate::named::NamedCache) owns one
//! [`CacheStatsRecorder`], created with the cache and updated inline on
//! the hot path. There is no global registry; callers that want a
//! deployment-wide view aggregate the snapshots the manager hands out.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for one named cache.
#[derive(Debug, Default)]
pub struct CacheStatsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    evictions: AtomicU64,
    corruption_evictions: AtomicU64,
    errors: AtomicU64,
}

impl CacheStatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corruption_eviction(&self) {
        self.corruption_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time snapshot of the counters.
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            corruption_evictions: self.corruption_evictions.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of one cache's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Reads served from the cache.
    pub hits: u64,
    /// Reads that found nothing.
    pub misses: u64,
    /// Loader invocations from `get_with`.
    pub loads: u64,
    /// Explicit evictions.
    pub evictions: u64,
    /// Evictions forced by an undecodable payload.
    pub corruption_evictions: u64,
    /// Tier errors observed on reads.
    pub errors: u64,
}

impl CacheStats {
    /// Hit rate over lookups that reached a verdict, in `[0, 1]`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_recorded_counts() {
        let recorder = CacheStatsRecorder::new();
        recorder.record_hit();
        recorder.record_hit();
        recorder.record_miss();
        recorder.record_load();
        recorder.record_corruption_eviction();
        recorder.record_error();

        let stats = recorder.snapshot();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.corruption_evictions, 1);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn test_hit_rate() {
        let mut stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 0.0);

        stats.hits = 3;
        stats.misses = 1;
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
