//! Memory governor: byte budget, admission, and preload back-pressure.
//!
//! The governor owns the resident-bytes counter and the budget
//! parameters; it commands the store to evict but never owns entries.
//! Admission runs under the store lock so byte accounting and store
//! contents move together (the counter itself is atomic so the monitor
//! reads it without the lock).

use crate::config::CacheConfig;
use crate::metrics::CacheCounters;
use frame_store::{CacheEntry, OrderedLruStore};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

/// How long resident bytes may sit above the soft limit before
/// preloading is paused.
const PRESSURE_GRACE: Duration = Duration::from_millis(200);

/// Soft-limit overshoot tolerated without starting the grace clock,
/// as a fraction of the hard limit.
const GRACE_MARGIN_RATIO: f64 = 0.01;

/// Eviction walks that skip this many pinned entries are pathological.
const PINNED_WALK_WARN: usize = 32;

/// Why an admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitError {
    /// The buffer alone exceeds the hard limit; no eviction can help.
    TooLarge,
    /// Every resident entry is pinned; nothing can be evicted.
    AllPinned,
}

/// Transition reported by the periodic pressure poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureChange {
    /// Soft limit held past the grace interval; pause preloading.
    Pause,
    /// Resident bytes fell to the post-eviction target; resume.
    Resume,
}

/// Enforces the residency budget and drives eviction.
#[derive(Debug)]
pub struct MemoryGovernor {
    hard_limit: u64,
    soft_limit: u64,
    target: u64,
    max_entries: usize,
    resident: AtomicU64,
    preload_paused: AtomicBool,
    soft_exceeded_since: Mutex<Option<Instant>>,
}

impl MemoryGovernor {
    /// Build a governor from validated configuration.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            hard_limit: config.hard_limit_bytes,
            soft_limit: config.soft_limit_bytes,
            target: config.target_after_eviction_bytes,
            max_entries: config.max_entries,
            resident: AtomicU64::new(0),
            preload_paused: AtomicBool::new(false),
            soft_exceeded_since: Mutex::new(None),
        }
    }

    /// Bytes currently resident.
    #[inline]
    pub fn resident_bytes(&self) -> u64 {
        self.resident.load(Ordering::Acquire)
    }

    /// Configured hard limit.
    #[inline]
    pub fn hard_limit_bytes(&self) -> u64 {
        self.hard_limit
    }

    /// Post-eviction target.
    #[inline]
    pub fn target_bytes(&self) -> u64 {
        self.target
    }

    /// `resident / hard_limit`.
    #[inline]
    pub fn usage_ratio(&self) -> f64 {
        self.resident_bytes() as f64 / self.hard_limit as f64
    }

    /// Whether preloading is currently paused by back-pressure.
    #[inline]
    pub fn is_preload_paused(&self) -> bool {
        self.preload_paused.load(Ordering::Acquire)
    }

    /// Admit `incoming` bytes, evicting from the tail as needed.
    ///
    /// Called with the store lock held. Returns the entries evicted to
    /// make room; the caller drops their buffers after releasing the
    /// lock. On success the resident counter already includes `incoming`.
    pub fn admit(
        &self,
        store: &mut OrderedLruStore,
        incoming: u64,
        counters: &CacheCounters,
    ) -> Result<Vec<CacheEntry>, AdmitError> {
        if incoming > self.hard_limit {
            counters.budget_rejections.fetch_add(1, Ordering::Relaxed);
            return Err(AdmitError::TooLarge);
        }

        let mut evicted = Vec::new();

        // Entry-count safety cap, independent of bytes.
        while store.len() >= self.max_entries {
            if !self.evict_one(store, &mut evicted) {
                counters.budget_rejections.fetch_add(1, Ordering::Relaxed);
                counters
                    .evictions
                    .fetch_add(evicted.len() as u64, Ordering::Relaxed);
                return Err(AdmitError::AllPinned);
            }
        }

        if self.resident_bytes() + incoming > self.soft_limit {
            // Reactive eviction down to the target.
            while self.resident_bytes() + incoming > self.target {
                if !self.evict_one(store, &mut evicted) {
                    break;
                }
            }
            if self.resident_bytes() + incoming > self.hard_limit {
                counters.budget_rejections.fetch_add(1, Ordering::Relaxed);
                counters
                    .evictions
                    .fetch_add(evicted.len() as u64, Ordering::Relaxed);
                return Err(AdmitError::AllPinned);
            }
        }

        self.resident.fetch_add(incoming, Ordering::AcqRel);
        counters
            .evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        Ok(evicted)
    }

    /// Evict unpinned entries until resident bytes are at or below the
    /// post-eviction target. Used by the sustained-latency corrective
    /// path. Returns the evicted entries.
    pub fn force_cleanup(
        &self,
        store: &mut OrderedLruStore,
        counters: &CacheCounters,
    ) -> Vec<CacheEntry> {
        let mut evicted = Vec::new();
        while self.resident_bytes() > self.target {
            if !self.evict_one(store, &mut evicted) {
                break;
            }
        }
        counters
            .evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        evicted
    }

    /// Settle accounting for bytes leaving the cache outside the
    /// admission path (invalidate, clear, deferred eviction).
    #[inline]
    pub fn release_bytes(&self, n: u64) {
        self.resident.fetch_sub(n, Ordering::AcqRel);
    }

    /// Settle accounting when a resident buffer is replaced in place.
    #[inline]
    pub fn swap_bytes(&self, old: u64, new: u64) {
        if new >= old {
            self.resident.fetch_add(new - old, Ordering::AcqRel);
        } else {
            self.resident.fetch_sub(old - new, Ordering::AcqRel);
        }
    }

    /// Periodic pressure check; called by the monitor thread.
    ///
    /// Pauses preloading when the soft limit stays crossed (by more than
    /// a small margin) past the grace interval, and resumes once
    /// resident bytes fall to the post-eviction target.
    pub fn poll_pressure(&self, now: Instant) -> Option<PressureChange> {
        let resident = self.resident_bytes();
        if self.preload_paused.load(Ordering::Acquire) {
            if resident <= self.target {
                self.preload_paused.store(false, Ordering::Release);
                *self.soft_exceeded_since.lock() = None;
                return Some(PressureChange::Resume);
            }
            return None;
        }

        let margin = (self.hard_limit as f64 * GRACE_MARGIN_RATIO) as u64;
        if resident > self.soft_limit + margin {
            let mut since = self.soft_exceeded_since.lock();
            match *since {
                None => *since = Some(now),
                Some(started) if now.duration_since(started) >= PRESSURE_GRACE => {
                    self.preload_paused.store(true, Ordering::Release);
                    return Some(PressureChange::Pause);
                }
                Some(_) => {}
            }
        } else {
            *self.soft_exceeded_since.lock() = None;
        }
        None
    }

    fn evict_one(&self, store: &mut OrderedLruStore, evicted: &mut Vec<CacheEntry>) -> bool {
        let outcome = store.evict_lru_skipping_pinned();
        if outcome.skipped_pinned >= PINNED_WALK_WARN {
            warn!(
                skipped = outcome.skipped_pinned,
                "eviction walk skipped many pinned entries"
            );
        }
        match outcome.entry {
            Some(entry) => {
                self.resident
                    .fetch_sub(entry.byte_size() as u64, Ordering::AcqRel);
                evicted.push(entry);
                true
            }
            None => false,
        }
    }
}
