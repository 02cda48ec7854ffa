//! The cache facade: sole entry point for frame consumers.
//!
//! `FrameCache` ties the store, governor, scheduler, predictor, and
//! latency tracker together behind the public operations. Every `get` is
//! timed against the frame-switch budget; misses go through single-flight
//! to the loader with whatever budget remains. Borrows are RAII pins:
//! dropping a `FrameBorrow` releases the pin without touching the store
//! lock unless a deferred eviction is pending.

use crate::config::{CacheConfig, ConfigError};
use crate::error::{CacheError, CacheResult};
use crate::events::{CacheEvent, EventBus, Severity};
use crate::governor::{AdmitError, MemoryGovernor};
use crate::loader::FrameLoader;
use crate::metrics::CacheCounters;
use crate::monitor::Monitor;
use crate::perf::{LatencyTracker, RollingStats};
use crate::predictor::{AccessPredictor, Direction};
use crate::preload::PreloadScheduler;
use crate::singleflight::{InFlightTable, Registration};
use frame_store::{FrameBuffer, FrameKey, FrameRange, OrderedLruStore, PinHandle};
use parking_lot::{Mutex, RwLock};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Metric name for loader-path warnings.
const FRAME_LOAD_METRIC: &str = "frame_load_ms";

/// Everything the facade, workers, and monitor share.
pub(crate) struct CacheCore {
    pub(crate) config: CacheConfig,
    pub(crate) store: Mutex<OrderedLruStore>,
    pub(crate) governor: MemoryGovernor,
    pub(crate) counters: CacheCounters,
    pub(crate) latency: LatencyTracker,
    pub(crate) predictor: Mutex<AccessPredictor>,
    pub(crate) inflight: InFlightTable,
    pub(crate) events: EventBus,
    pub(crate) loader: Arc<dyn FrameLoader>,
    pub(crate) range: RwLock<Option<FrameRange>>,
}

impl CacheCore {
    pub(crate) fn frame_range(&self) -> Option<FrameRange> {
        *self.range.read()
    }

    /// Residency probe; doomed entries count as absent.
    pub(crate) fn is_resident(&self, key: FrameKey) -> bool {
        let store = self.store.lock();
        store.peek(key).is_some_and(|entry| !entry.is_doomed())
    }

    /// Register as single-flight leader for `key`. False means another
    /// load is already in flight.
    pub(crate) fn begin_flight(&self, key: FrameKey) -> bool {
        matches!(self.inflight.register(key), Registration::Leader)
    }

    /// Deposit a loaded buffer without pinning (preload path).
    pub(crate) fn deposit_unpinned(&self, key: FrameKey, buffer: FrameBuffer) -> Result<(), AdmitError> {
        self.deposit(key, buffer, false).map(|_| ())
    }

    /// Deposit a loaded buffer, admitting under the budget.
    ///
    /// Returns the resident buffer and, when `pin` is set, the pin backing
    /// a borrow. A deposit for an already-resident key refreshes recency
    /// and keeps the resident buffer; a deposit for a doomed entry revives
    /// it in place (old borrows keep their bytes, accounting follows the
    /// new buffer).
    pub(crate) fn deposit(
        &self,
        key: FrameKey,
        buffer: FrameBuffer,
        pin: bool,
    ) -> Result<(FrameBuffer, Option<Arc<PinHandle>>), AdmitError> {
        let incoming = buffer.byte_size() as u64;
        let mut store = self.store.lock();

        if store.contains(key) {
            store.touch(key);
            let entry = store.peek_mut(key).expect("resident key must peek");
            let pin_handle = entry.pin_handle();
            let mut replaced = None;
            if entry.is_doomed() {
                let old_size = entry.byte_size() as u64;
                replaced = Some(entry.replace_buffer(buffer));
                pin_handle.undoom();
                self.governor.swap_bytes(old_size, incoming);
            }
            let resident_buffer = entry.buffer().clone();
            if pin {
                pin_handle.pin();
            }
            drop(store);
            drop(replaced);
            return Ok((resident_buffer, pin.then_some(pin_handle)));
        }

        let evicted = self.governor.admit(&mut store, incoming, &self.counters)?;
        let resident_buffer = buffer.clone();
        store.insert(key, buffer);
        let pin_handle = store
            .peek(key)
            .expect("inserted key must peek")
            .pin_handle();
        if pin {
            pin_handle.pin();
        }
        drop(store);
        // Evicted buffers are released here, before the deposit returns.
        drop(evicted);

        self.counters.record_put();
        self.publish_memory_usage();
        Ok((resident_buffer, pin.then_some(pin_handle)))
    }

    /// Remove an entry whose deferred eviction came due.
    pub(crate) fn finish_deferred(&self, key: FrameKey) {
        let removed = {
            let mut store = self.store.lock();
            let due = store
                .peek(key)
                .is_some_and(|entry| entry.is_doomed() && !entry.is_pinned());
            if due { store.remove(key) } else { None }
        };
        if let Some(entry) = removed {
            self.governor.release_bytes(entry.byte_size() as u64);
            self.counters
                .deferred_evictions
                .fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "deferred eviction completed");
        }
    }

    pub(crate) fn publish_memory_usage(&self) {
        self.events.publish(CacheEvent::MemoryUsage {
            resident_bytes: self.governor.resident_bytes(),
            hard_limit_bytes: self.governor.hard_limit_bytes(),
            usage_ratio: self.governor.usage_ratio(),
        });
    }

    fn record_access(&self, key: FrameKey) {
        self.predictor.lock().record(key);
    }

    fn warn_load_failure(&self, elapsed: Duration, severity: Severity) {
        self.events.publish(CacheEvent::PerformanceWarning {
            metric: FRAME_LOAD_METRIC,
            value: elapsed.as_secs_f64() * 1000.0,
            threshold: self.config.frame_switch_budget_ms as f64,
            severity,
        });
    }
}

/// Aggregate statistics for one cache instance.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    /// Foreground hits.
    pub hits: u64,
    /// Foreground misses.
    pub misses: u64,
    /// Hit rate in `[0, 1]` over all gets.
    pub hit_rate: f64,
    /// Bytes currently resident.
    pub resident_bytes: u64,
    /// Entries currently resident.
    pub entry_count: usize,
    /// Entries evicted by the governor.
    pub evictions: u64,
    /// Rolling latency over the sample ring.
    pub latency: RollingStats,
    /// Rolling latency over the most recent hundred calls.
    pub recent_latency: RollingStats,
}

/// Borrowed access to a resident frame.
///
/// Holding a borrow pins the entry: it cannot be evicted until the borrow
/// is dropped. Dropping releases the pin without taking the store lock
/// unless this was the last borrow of an entry marked for deferred
/// eviction.
pub struct FrameBorrow {
    key: FrameKey,
    buffer: FrameBuffer,
    pin: Arc<PinHandle>,
    core: Arc<CacheCore>,
}

impl FrameBorrow {
    /// The borrowed frame's key.
    pub fn key(&self) -> FrameKey {
        self.key
    }

    /// The borrowed buffer.
    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    /// Release the borrow explicitly. Equivalent to dropping it.
    pub fn release(self) {}
}

impl Deref for FrameBorrow {
    type Target = FrameBuffer;

    fn deref(&self) -> &FrameBuffer {
        &self.buffer
    }
}

impl Drop for FrameBorrow {
    fn drop(&mut self) {
        if self.pin.unpin() == 0 && self.pin.is_doomed() {
            self.core.finish_deferred(self.key);
        }
    }
}

impl std::fmt::Debug for FrameBorrow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBorrow")
            .field("key", &self.key)
            .field("byte_size", &self.buffer.byte_size())
            .finish()
    }
}

/// The frame cache and preload engine.
///
/// One instance per open project; configuration is injected at
/// construction and immutable thereafter. All operations are safe to call
/// from any thread.
pub struct FrameCache {
    core: Arc<CacheCore>,
    scheduler: Arc<PreloadScheduler>,
    monitor: Monitor,
}

impl FrameCache {
    /// Build the engine: validates configuration, spawns the preload
    /// worker pool and the monitor thread.
    pub fn new(config: CacheConfig, loader: Arc<dyn FrameLoader>) -> Result<Self, ConfigError> {
        config.validate()?;

        let core = Arc::new(CacheCore {
            latency: LatencyTracker::new(config.warn_threshold(), config.hard_threshold()),
            governor: MemoryGovernor::new(&config),
            predictor: Mutex::new(AccessPredictor::new(config.predictor_window)),
            store: Mutex::new(OrderedLruStore::with_capacity(config.max_entries)),
            counters: CacheCounters::new(),
            inflight: InFlightTable::new(),
            events: EventBus::new(),
            loader,
            range: RwLock::new(None),
            config,
        });
        let scheduler = Arc::new(PreloadScheduler::start(Arc::clone(&core)));
        let monitor = Monitor::start(Arc::clone(&core), Arc::clone(&scheduler));

        info!(
            hard_limit_bytes = core.config.hard_limit_bytes,
            workers = core.config.worker_count,
            "frame cache started"
        );
        Ok(Self {
            core,
            scheduler,
            monitor,
        })
    }

    /// Fetch a frame, loading it within the remaining budget on a miss.
    ///
    /// The total elapsed time is measured against the frame-switch
    /// contract; overruns publish warnings but a late result is still
    /// returned. Concurrent gets for the same missing key share one
    /// loader invocation.
    pub fn get(&self, key: FrameKey) -> CacheResult<FrameBorrow> {
        let start = Instant::now();
        self.check_key(key)?;
        let deadline = start + self.core.config.frame_switch_budget();

        // Hit path: one O(1) critical section, buffer handed out by
        // refcount, no allocation beyond the borrow itself. Doomed
        // entries are probed with `peek` so they never touch recency or
        // hit bookkeeping on their way to the miss path.
        {
            let mut store = self.core.store.lock();
            let live = store.peek(key).is_some_and(|entry| !entry.is_doomed());
            if live {
                let entry = store.get(key).expect("probed key must resolve");
                let pin = entry.pin_handle();
                pin.pin();
                let buffer = entry.buffer().clone();
                drop(store);

                self.core.counters.record_get(true);
                self.core.record_access(key);
                let elapsed = start.elapsed();
                self.core.events.publish(CacheEvent::CacheHit { key, elapsed });
                self.core.latency.record(true, elapsed, &self.core.events);
                self.retarget_from_access(key);
                return Ok(self.borrow(key, buffer, pin));
            }
        }

        self.core.counters.record_get(false);
        let result = match self.core.inflight.register(key) {
            Registration::Leader => self.load_as_leader(key, deadline),
            Registration::Follower(flight) => match flight.wait_until(deadline) {
                Some(Some(buffer)) => self.admit_foreground(key, buffer),
                Some(None) => Err(CacheError::NotFound),
                None => {
                    self.core.counters.loader_overruns.fetch_add(1, Ordering::Relaxed);
                    self.core.warn_load_failure(start.elapsed(), Severity::Warning);
                    Err(CacheError::NotFound)
                }
            },
        };

        let elapsed = start.elapsed();
        match result {
            Ok((buffer, pin, load_elapsed)) => {
                self.core.record_access(key);
                self.core
                    .events
                    .publish(CacheEvent::CacheMiss { key, load_elapsed });
                self.core.latency.record(false, elapsed, &self.core.events);
                self.retarget_from_access(key);
                Ok(self.borrow(key, buffer, pin))
            }
            Err(err) => {
                self.core.latency.record(false, elapsed, &self.core.events);
                Err(err)
            }
        }
    }

    /// Keep the prefetch window tracking the cursor as accesses move it.
    /// Runs after the call is measured; an unchanged cursor is a no-op.
    fn retarget_from_access(&self, key: FrameKey) {
        let direction = self.core.predictor.lock().predict().direction;
        self.scheduler.retarget(key, direction);
    }

    /// Deposit a prefetched frame. A put for an already-resident key is a
    /// no-op that refreshes recency. Evicted buffers are released before
    /// this returns.
    pub fn put(&self, key: FrameKey, buffer: FrameBuffer) -> CacheResult<()> {
        self.check_key(key)?;
        match self.core.deposit_unpinned(key, buffer) {
            Ok(()) => Ok(()),
            Err(AdmitError::TooLarge) | Err(AdmitError::AllPinned) => {
                Err(CacheError::BudgetExhausted)
            }
        }
    }

    /// Remove an entry. Pinned entries are marked for deferred eviction
    /// at final release instead.
    pub fn invalidate(&self, key: FrameKey) {
        let removed = {
            let mut store = self.core.store.lock();
            let Some(entry) = store.peek(key) else {
                return;
            };
            if entry.is_pinned() {
                entry.pin_handle().doom();
                debug!(key = %key, "invalidate deferred until final release");
                None
            } else {
                store.remove(key)
            }
        };
        if let Some(entry) = removed {
            self.core.governor.release_bytes(entry.byte_size() as u64);
        }
    }

    /// Remove all unpinned entries; pinned entries are marked for
    /// deferred eviction.
    pub fn clear(&self) {
        let (drained, doomed) = {
            let mut store = self.core.store.lock();
            let drained = store.drain_unpinned();
            let doomed = store.doom_remaining();
            (drained, doomed)
        };
        let freed: u64 = drained.iter().map(|e| e.byte_size() as u64).sum();
        self.core.governor.release_bytes(freed);
        debug!(
            dropped = drained.len(),
            deferred = doomed,
            "cache cleared"
        );
    }

    /// Residency probe; does not touch recency.
    pub fn contains(&self, key: FrameKey) -> bool {
        self.core.is_resident(key)
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> CacheStats {
        let snapshot = self.core.counters.snapshot();
        CacheStats {
            hits: snapshot.hits,
            misses: snapshot.misses,
            hit_rate: snapshot.hit_rate(),
            resident_bytes: self.core.governor.resident_bytes(),
            entry_count: self.core.store.lock().len(),
            evictions: snapshot.evictions,
            latency: self.core.latency.rolling(),
            recent_latency: self.core.latency.recent(),
        }
    }

    /// Register a subscriber for all cache events.
    pub fn subscribe<F>(&self, f: F)
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.core.events.subscribe(f);
    }

    /// Cursor moved: feed the predictor and retarget the prefetch window.
    ///
    /// An explicit `direction_hint` from the navigation layer overrides
    /// the predictor's classification.
    pub fn frame_changed(
        &self,
        current: FrameKey,
        previous: Option<FrameKey>,
        direction_hint: Option<Direction>,
    ) {
        let Some(range) = self.core.frame_range() else {
            return;
        };
        let current = range.clamp(current);
        trace!(current = %current, previous = ?previous, "frame changed");

        let predicted = {
            let mut predictor = self.core.predictor.lock();
            predictor.record(current);
            predictor.predict()
        };
        let direction = direction_hint.unwrap_or(predicted.direction);
        self.scheduler.retarget(current, direction);
    }

    /// Preload an explicit inclusive range at normal priority.
    pub fn preload_range(&self, start: FrameKey, end: FrameKey) {
        self.scheduler.preload_range(start, end);
    }

    /// New project: reset caches and configure the key bounds.
    pub fn project_opened(&self, range: FrameRange) {
        info!(first = %range.first(), last = %range.last(), "project opened");
        *self.core.range.write() = Some(range);
        self.scheduler.clear_queue();
        self.scheduler.reset_window();
        self.clear();
        self.core.predictor.lock().reset();
        self.core.publish_memory_usage();
    }

    fn check_key(&self, key: FrameKey) -> CacheResult<()> {
        match self.core.frame_range() {
            None => Err(CacheError::NoProject),
            Some(range) if !range.contains(key) => Err(CacheError::InvalidKey),
            Some(_) => Ok(()),
        }
    }

    fn borrow(&self, key: FrameKey, buffer: FrameBuffer, pin: Arc<PinHandle>) -> FrameBorrow {
        FrameBorrow {
            key,
            buffer,
            pin,
            core: Arc::clone(&self.core),
        }
    }

    /// Leader side of a foreground miss: invoke the loader with the
    /// remaining budget and publish the result to any followers.
    fn load_as_leader(
        &self,
        key: FrameKey,
        deadline: Instant,
    ) -> Result<(FrameBuffer, Arc<PinHandle>, Duration), CacheError> {
        // The frame may have landed between the store probe and flight
        // registration; serve it without another load. Doomed entries
        // are probed with `peek` so they never touch recency.
        {
            let mut store = self.core.store.lock();
            let live = store.peek(key).is_some_and(|entry| !entry.is_doomed());
            if live {
                let entry = store.get(key).expect("probed key must resolve");
                let pin = entry.pin_handle();
                pin.pin();
                let buffer = entry.buffer().clone();
                drop(store);
                self.core.inflight.complete(key, Some(buffer.clone()));
                return Ok((buffer, pin, Duration::ZERO));
            }
        }

        let load_start = Instant::now();
        match self.core.loader.load(key, deadline) {
            Ok(buffer) => {
                let load_elapsed = load_start.elapsed();
                if Instant::now() > deadline {
                    // Late result: counted, warned, but still served.
                    self.core.counters.loader_overruns.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, ?load_elapsed, "loader overran its deadline");
                }
                match self.core.deposit(key, buffer.clone(), true) {
                    Ok((resident, pin)) => {
                        self.core.inflight.complete(key, Some(buffer));
                        Ok((resident, pin.expect("pinned deposit returns a pin"), load_elapsed))
                    }
                    Err(admit_err) => {
                        self.core.inflight.complete(key, Some(buffer));
                        self.core.warn_load_failure(load_elapsed, Severity::Error);
                        match admit_err {
                            AdmitError::TooLarge => Err(CacheError::BudgetExhausted),
                            AdmitError::AllPinned => Err(CacheError::NotFound),
                        }
                    }
                }
            }
            Err(err) => {
                let load_elapsed = load_start.elapsed();
                self.core.inflight.complete(key, None);
                self.core.counters.loader_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %err, "frame load failed");
                self.core.warn_load_failure(load_elapsed, Severity::Warning);
                Err(CacheError::NotFound)
            }
        }
    }

    /// Follower side: a shared flight delivered a buffer; make sure it is
    /// resident and pin it for this caller.
    fn admit_foreground(
        &self,
        key: FrameKey,
        buffer: FrameBuffer,
    ) -> Result<(FrameBuffer, Arc<PinHandle>, Duration), CacheError> {
        match self.core.deposit(key, buffer, true) {
            Ok((resident, pin)) => Ok((
                resident,
                pin.expect("pinned deposit returns a pin"),
                Duration::ZERO,
            )),
            Err(AdmitError::TooLarge) => Err(CacheError::BudgetExhausted),
            Err(AdmitError::AllPinned) => {
                self.core.warn_load_failure(Duration::ZERO, Severity::Error);
                Err(CacheError::NotFound)
            }
        }
    }
}

impl Drop for FrameCache {
    fn drop(&mut self) {
        self.monitor.shutdown();
        self.scheduler.shutdown();
        debug!("frame cache shut down");
    }
}

impl std::fmt::Debug for FrameCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCache")
            .field("resident_bytes", &self.core.governor.resident_bytes())
            .field("entries", &self.core.store.lock().len())
            .finish()
    }
}
