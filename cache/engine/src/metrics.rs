//! Per-instance cache counters.
//!
//! Counters are plain atomics owned by the cache instance (the engine has
//! no global mutable state; tests construct independent instances). The
//! snapshot type supports interval math for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic operation counters for one cache instance.
#[derive(Debug, Default)]
pub struct CacheCounters {
    /// Foreground `get` calls.
    pub gets: AtomicU64,
    /// `get` calls served from resident state.
    pub hits: AtomicU64,
    /// `get` calls that required a loader invocation.
    pub misses: AtomicU64,
    /// Buffers deposited through `put` or preload admission.
    pub puts: AtomicU64,
    /// Entries evicted by the governor.
    pub evictions: AtomicU64,
    /// Entries removed by a deferred eviction at final release.
    pub deferred_evictions: AtomicU64,
    /// Admissions rejected by the byte budget.
    pub budget_rejections: AtomicU64,
    /// Loader invocations that returned an error.
    pub loader_errors: AtomicU64,
    /// Loader invocations that returned after their deadline.
    pub loader_overruns: AtomicU64,
    /// Prefetch tasks completed and admitted.
    pub preload_completed: AtomicU64,
    /// Prefetch tasks cancelled before admission.
    pub preload_cancelled: AtomicU64,
    /// Prefetch tasks that expired in the queue.
    pub preload_expired: AtomicU64,
    /// Prefetch tasks whose load failed.
    pub preload_failed: AtomicU64,
    /// Failed prefetch tasks re-queued at low priority.
    pub preload_retries: AtomicU64,
}

impl CacheCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a foreground `get`.
    #[inline]
    pub fn record_get(&self, hit: bool) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an admitted deposit.
    #[inline]
    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record governor evictions.
    #[inline]
    pub fn record_evictions(&self, n: u64) {
        self.evictions.fetch_add(n, Ordering::Relaxed);
    }

    /// Snapshot current values.
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            gets: self.gets.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            deferred_evictions: self.deferred_evictions.load(Ordering::Relaxed),
            budget_rejections: self.budget_rejections.load(Ordering::Relaxed),
            loader_errors: self.loader_errors.load(Ordering::Relaxed),
            loader_overruns: self.loader_overruns.load(Ordering::Relaxed),
            preload_completed: self.preload_completed.load(Ordering::Relaxed),
            preload_cancelled: self.preload_cancelled.load(Ordering::Relaxed),
            preload_expired: self.preload_expired.load(Ordering::Relaxed),
            preload_failed: self.preload_failed.load(Ordering::Relaxed),
            preload_retries: self.preload_retries.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    /// Foreground `get` calls.
    pub gets: u64,
    /// Hits.
    pub hits: u64,
    /// Misses.
    pub misses: u64,
    /// Admitted deposits.
    pub puts: u64,
    /// Governor evictions.
    pub evictions: u64,
    /// Deferred evictions.
    pub deferred_evictions: u64,
    /// Budget rejections.
    pub budget_rejections: u64,
    /// Loader errors.
    pub loader_errors: u64,
    /// Loader deadline overruns.
    pub loader_overruns: u64,
    /// Prefetches admitted.
    pub preload_completed: u64,
    /// Prefetches cancelled.
    pub preload_cancelled: u64,
    /// Prefetches expired in queue.
    pub preload_expired: u64,
    /// Prefetches failed.
    pub preload_failed: u64,
    /// Prefetch retries.
    pub preload_retries: u64,
}

impl CountersSnapshot {
    /// Hit rate in `[0, 1]` over all recorded gets.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Difference between two snapshots (`self - other`).
    pub fn diff(&self, other: &CountersSnapshot) -> CountersSnapshot {
        CountersSnapshot {
            gets: self.gets.saturating_sub(other.gets),
            hits: self.hits.saturating_sub(other.hits),
            misses: self.misses.saturating_sub(other.misses),
            puts: self.puts.saturating_sub(other.puts),
            evictions: self.evictions.saturating_sub(other.evictions),
            deferred_evictions: self.deferred_evictions.saturating_sub(other.deferred_evictions),
            budget_rejections: self.budget_rejections.saturating_sub(other.budget_rejections),
            loader_errors: self.loader_errors.saturating_sub(other.loader_errors),
            loader_overruns: self.loader_overruns.saturating_sub(other.loader_overruns),
            preload_completed: self.preload_completed.saturating_sub(other.preload_completed),
            preload_cancelled: self.preload_cancelled.saturating_sub(other.preload_cancelled),
            preload_expired: self.preload_expired.saturating_sub(other.preload_expired),
            preload_failed: self.preload_failed.saturating_sub(other.preload_failed),
            preload_retries: self.preload_retries.saturating_sub(other.preload_retries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_get() {
        let counters = CacheCounters::new();
        counters.record_get(true);
        counters.record_get(true);
        counters.record_get(false);

        let snap = counters.snapshot();
        assert_eq!(snap.gets, 3);
        assert_eq!(snap.hits, 2);
        assert_eq!(snap.misses, 1);
        assert!((snap.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_hits_plus_misses_equals_gets() {
        let counters = CacheCounters::new();
        for i in 0..100 {
            counters.record_get(i % 3 != 0);
        }
        let snap = counters.snapshot();
        assert_eq!(snap.hits + snap.misses, snap.gets);
    }

    #[test]
    fn test_empty_hit_rate() {
        assert_eq!(CountersSnapshot::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_snapshot_diff() {
        let counters = CacheCounters::new();
        counters.record_get(true);
        let before = counters.snapshot();
        counters.record_get(false);
        counters.record_evictions(3);
        let after = counters.snapshot();

        let diff = after.diff(&before);
        assert_eq!(diff.gets, 1);
        assert_eq!(diff.misses, 1);
        assert_eq!(diff.evictions, 3);
        assert_eq!(diff.hits, 0);
    }
}
