//! Hit/miss accounting for the cache.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time view of cache usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, or 0.0 before any lookup.
    pub hit_rate: f64,
    /// Serialized byte length of all in-memory entries.
    pub size: usize,
    /// Number of in-memory entries.
    pub item_count: usize,
}

impl CacheStats {
    pub fn total_lookups(&self) -> u64 {
        self.hits + self.misses
    }
}

/// Summary of the persistent tier as currently stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentStats {
    pub entries: usize,
    pub fresh: usize,
    pub stale: usize,
    /// Entries that do not parse; the next sweep removes them.
    pub unreadable: usize,
    /// Key plus value byte length of every entry.
    pub bytes: u64,
}

/// Lock-free hit/miss counters.
#[derive(Debug, Default)]
pub(crate) struct StatsCollector {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StatsCollector {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, size: usize, item_count: usize) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };

        CacheStats {
            hits,
            misses,
            hit_rate,
            size,
            item_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_zero_without_lookups() {
        let stats = StatsCollector::default().snapshot(0, 0);
        assert_eq!(stats.hit_rate, 0.0);
        assert_eq!(stats.total_lookups(), 0);
    }

    #[test]
    fn test_hit_rate_ratio() {
        let collector = StatsCollector::default();
        for _ in 0..3 {
            collector.record_hit();
        }
        collector.record_miss();

        let stats = collector.snapshot(128, 2);
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.75).abs() < f64::EPSILON);
        assert_eq!(stats.size, 128);
        assert_eq!(stats.item_count, 2);
    }

    #[test]
    fn test_reset() {
        let collector = StatsCollector::default();
        collector.record_hit();
        collector.record_miss();
        collector.reset();

        let stats = collector.snapshot(0, 0);
        assert_eq!(stats.total_lookups(), 0);
    }

    #[test]
    fn test_serializes_camel_case() {
        let stats = StatsCollector::default().snapshot(10, 1);
        let json = serde_json::to_value(&stats).expect("serialize");
        assert!(json.get("hitRate").is_some());
        assert!(json.get("itemCount").is_some());
    }
}
