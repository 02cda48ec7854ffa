//! Background preload scheduler.
//!
//! Keeps the cache hot around the cursor without ever touching foreground
//! `get` latency. A fixed pool of worker threads drains a three-level
//! priority queue (high before normal before low, FIFO within each).
//! Tasks are cooperative: the cancel flag is consulted before the load
//! and again before admission, and a cancelled task's buffer is dropped
//! without admission. The queue and its dedup set use their own lock,
//! independent of the store lock.

use crate::events::{CacheEvent, PauseReason};
use crate::facade::CacheCore;
use crate::predictor::Direction;
use ahash::RandomState;
use frame_store::FrameKey;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Frames on either side of the cursor that rate the high priority when
/// they sit in the predicted direction.
const HIGH_ADJACENT: i64 = 2;

/// Frames on either side of the cursor that rate the normal priority.
const NEAR_WINDOW: i64 = 10;

/// How long an idle worker sleeps before re-checking queue state.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Smallest window scale the corrective shrink can reach, percent.
const MIN_WINDOW_SCALE: u32 = 25;

/// Task priority; strict preemption of queue choice, not of running tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Immediately adjacent to the cursor in the predicted direction.
    High,
    /// Within the near window around the cursor.
    Normal,
    /// Elsewhere in the prefetch window.
    Low,
}

#[derive(Debug)]
struct PrefetchTask {
    key: FrameKey,
    priority: Priority,
    deadline: Instant,
    cancel: Arc<AtomicBool>,
    retried: bool,
}

#[derive(Default)]
struct QueueState {
    high: VecDeque<PrefetchTask>,
    normal: VecDeque<PrefetchTask>,
    low: VecDeque<PrefetchTask>,
    /// Cancel flags for queued tasks, keyed by frame. At most one live
    /// task per key; stale cancelled tasks in the deques are dropped when
    /// claimed.
    queued: HashMap<FrameKey, Arc<AtomicBool>, RandomState>,
    cursor: Option<FrameKey>,
    direction: Option<Direction>,
    window_extent: i64,
    shutdown: bool,
}

struct SchedulerShared {
    core: Arc<CacheCore>,
    queue: Mutex<QueueState>,
    cv: Condvar,
    /// Prefetch window scale in percent; halved by corrective actions.
    window_scale_pct: AtomicU32,
}

/// Owns the prefetch queue and the worker pool.
pub(crate) struct PreloadScheduler {
    shared: Arc<SchedulerShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PreloadScheduler {
    /// Spawn the worker pool against `core`.
    pub(crate) fn start(core: Arc<CacheCore>) -> Self {
        let shared = Arc::new(SchedulerShared {
            core,
            queue: Mutex::new(QueueState::default()),
            cv: Condvar::new(),
            window_scale_pct: AtomicU32::new(100),
        });

        let count = shared.core.config.worker_count;
        let mut workers = Vec::with_capacity(count);
        for worker_id in 0..count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("preload-{worker_id}"))
                .spawn(move || run_worker(&shared))
                .expect("failed to spawn preload worker");
            workers.push(handle);
        }

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Recompute the prefetch window around `cursor` and reconcile the
    /// queue: enqueue missing keys, cancel tasks that fell outside.
    ///
    /// Called on every `frame_changed` hint and on foreground accesses
    /// that move the cursor; an unchanged cursor and direction is a cheap
    /// no-op, so the hot-spot pattern costs one lock probe.
    pub(crate) fn retarget(&self, cursor: FrameKey, direction: Direction) {
        let core = &self.shared.core;
        let Some(range) = core.frame_range() else {
            return;
        };
        {
            let queue = self.shared.queue.lock();
            if queue.cursor == Some(cursor) && queue.direction == Some(direction) {
                return;
            }
        }

        let scale = self.shared.window_scale_pct.load(Ordering::Acquire);
        let (back, forward) = scaled_window(
            core.config.preload_back,
            core.config.preload_forward,
            direction,
            scale,
        );

        // Build the wanted set outside the queue lock.
        let mut wanted: Vec<(FrameKey, Priority)> = Vec::new();
        let mut seen: HashSet<FrameKey> = HashSet::new();
        seen.insert(cursor);
        for delta in 1..=i64::from(forward) {
            let key = range.offset(cursor, delta);
            if seen.insert(key) {
                wanted.push((key, priority_for(delta, direction)));
            }
        }
        for delta in 1..=i64::from(back) {
            let key = range.offset(cursor, -delta);
            if seen.insert(key) {
                wanted.push((key, priority_for(-delta, direction)));
            }
        }
        // One store pass filters out what is already resident.
        {
            let store = core.store.lock();
            wanted.retain(|(key, _)| store.peek(*key).is_none_or(|e| e.is_doomed()));
        }

        let deadline = Instant::now() + core.config.prefetch_deadline();
        let extent = i64::from(back.max(forward));

        let mut queue = self.shared.queue.lock();
        queue.cursor = Some(cursor);
        queue.direction = Some(direction);
        queue.window_extent = extent;

        // Cancel queued tasks that are no longer in the window.
        queue.queued.retain(|key, cancel| {
            let delta = key.distance_from(cursor);
            let keep = -i64::from(back) <= delta && delta <= i64::from(forward);
            if !keep {
                cancel.store(true, Ordering::Release);
            }
            keep
        });

        let mut enqueued = 0usize;
        for (key, priority) in wanted {
            if queue.queued.contains_key(&key) || core.inflight.contains(key) {
                continue;
            }
            push_task(&mut queue, key, priority, deadline, false);
            enqueued += 1;
        }
        drop(queue);

        if enqueued > 0 {
            trace!(cursor = %cursor, enqueued, "prefetch window retargeted");
            self.shared.cv.notify_all();
        }
    }

    /// Enqueue an explicit inclusive key range at normal priority.
    pub(crate) fn preload_range(&self, start: FrameKey, end: FrameKey) {
        let core = &self.shared.core;
        let Some(range) = core.frame_range() else {
            return;
        };
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        let start = range.clamp(start);
        let end = range.clamp(end);

        let wanted: Vec<FrameKey> = {
            let store = core.store.lock();
            (start.index()..=end.index())
                .map(FrameKey::new)
                .filter(|key| store.peek(*key).is_none_or(|e| e.is_doomed()))
                .collect()
        };

        let deadline = Instant::now() + core.config.prefetch_deadline();
        let mut queue = self.shared.queue.lock();
        let mut enqueued = 0usize;
        for key in wanted {
            if queue.queued.contains_key(&key) || core.inflight.contains(key) {
                continue;
            }
            push_task(&mut queue, key, Priority::Normal, deadline, false);
            enqueued += 1;
        }
        drop(queue);
        if enqueued > 0 {
            self.shared.cv.notify_all();
        }
    }

    /// Back-pressure entry: cancel low-priority work and the far half of
    /// the normal window, then tell consumers preloading paused.
    ///
    /// The governor's pause flag is what workers consult before claiming
    /// normal/low tasks; this trims what is already queued.
    pub(crate) fn pause(&self, reason: PauseReason) {
        let mut queue = self.shared.queue.lock();
        let cursor = queue.cursor;
        let half_extent = queue.window_extent / 2;

        for task in queue.low.drain(..) {
            task.cancel.store(true, Ordering::Release);
        }
        if let Some(cursor) = cursor {
            for task in &queue.normal {
                if task.key.distance_from(cursor).abs() > half_extent {
                    task.cancel.store(true, Ordering::Release);
                }
            }
        }
        queue
            .queued
            .retain(|_, cancel| !cancel.load(Ordering::Acquire));
        drop(queue);

        debug!(?reason, "preloading paused");
        self.shared.core.events.publish(CacheEvent::PreloadPaused { reason });
    }

    /// Resume after back-pressure; the next retarget refills the window.
    pub(crate) fn resume(&self) {
        debug!("preloading resumed");
        self.shared.core.events.publish(CacheEvent::PreloadResumed);
        self.shared.cv.notify_all();
    }

    /// Halve the prefetch window. Corrective action for sustained
    /// latency violations.
    pub(crate) fn shrink_window(&self) {
        let scale = self.shared.window_scale_pct.load(Ordering::Acquire);
        let shrunk = (scale / 2).max(MIN_WINDOW_SCALE);
        self.shared.window_scale_pct.store(shrunk, Ordering::Release);
        debug!(scale_pct = shrunk, "prefetch window shrunk");
    }

    /// Restore the full prefetch window (new project).
    pub(crate) fn reset_window(&self) {
        self.shared.window_scale_pct.store(100, Ordering::Release);
    }

    /// Drop all queued work (project switch).
    pub(crate) fn clear_queue(&self) {
        let mut queue = self.shared.queue.lock();
        let state = &mut *queue;
        for task in state
            .high
            .drain(..)
            .chain(state.normal.drain(..))
            .chain(state.low.drain(..))
        {
            task.cancel.store(true, Ordering::Release);
        }
        state.queued.clear();
        state.cursor = None;
        state.direction = None;
    }

    /// Stop the pool and join every worker. Idempotent.
    pub(crate) fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
        }
        self.shared.cv.notify_all();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            let _ = handle.join();
        }
        self.shared.core.events.publish(CacheEvent::PreloadPaused {
            reason: PauseReason::Shutdown,
        });
    }
}

fn push_task(
    queue: &mut QueueState,
    key: FrameKey,
    priority: Priority,
    deadline: Instant,
    retried: bool,
) {
    let cancel = Arc::new(AtomicBool::new(false));
    queue.queued.insert(key, Arc::clone(&cancel));
    let task = PrefetchTask {
        key,
        priority,
        deadline,
        cancel,
        retried,
    };
    match priority {
        Priority::High => queue.high.push_back(task),
        Priority::Normal => queue.normal.push_back(task),
        Priority::Low => queue.low.push_back(task),
    }
}

/// Window sizes for a direction, scaled by the corrective percentage.
fn scaled_window(back: u32, forward: u32, direction: Direction, scale_pct: u32) -> (u32, u32) {
    let (back, forward) = match direction {
        Direction::Forward => (back, forward),
        Direction::Backward => (forward, back),
        Direction::Stationary | Direction::Random => {
            let half = (back + forward) / 2;
            (half, half)
        }
    };
    // A zero-sized side stays zero (preloading disabled for that side);
    // a configured side never scales below one frame.
    let apply = |n: u32| {
        if n == 0 {
            0
        } else {
            ((n * scale_pct) / 100).max(1)
        }
    };
    (apply(back), apply(forward))
}

/// Priority of a window key at signed `delta` from the cursor.
fn priority_for(delta: i64, direction: Direction) -> Priority {
    let toward_predicted = match direction {
        Direction::Forward => delta > 0,
        Direction::Backward => delta < 0,
        Direction::Stationary | Direction::Random => true,
    };
    if toward_predicted && delta.abs() <= HIGH_ADJACENT {
        Priority::High
    } else if delta.abs() <= NEAR_WINDOW {
        Priority::Normal
    } else {
        Priority::Low
    }
}

fn run_worker(shared: &SchedulerShared) {
    while let Some(task) = next_task(shared) {
        execute(shared, task);
    }
}

/// Claim the next runnable task: high before normal before low, FIFO
/// within a priority. Normal and low are withheld while the governor has
/// preloading paused.
fn next_task(shared: &SchedulerShared) -> Option<PrefetchTask> {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            return None;
        }
        let paused = shared.core.governor.is_preload_paused();
        let task = if let Some(task) = queue.high.pop_front() {
            Some(task)
        } else if paused {
            None
        } else if let Some(task) = queue.normal.pop_front() {
            Some(task)
        } else {
            queue.low.pop_front()
        };
        if let Some(task) = task {
            // The map entry may already belong to a newer task for the
            // same key; only remove it if it is ours.
            if let Some(flag) = queue.queued.get(&task.key)
                && Arc::ptr_eq(flag, &task.cancel)
            {
                queue.queued.remove(&task.key);
            }
            return Some(task);
        }
        shared.cv.wait_for(&mut queue, IDLE_WAIT);
    }
}

fn execute(shared: &SchedulerShared, task: PrefetchTask) {
    let core = &shared.core;
    let counters = &core.counters;

    if task.cancel.load(Ordering::Acquire) {
        counters.preload_cancelled.fetch_add(1, Ordering::Relaxed);
        return;
    }
    if Instant::now() >= task.deadline {
        counters.preload_expired.fetch_add(1, Ordering::Relaxed);
        return;
    }
    if core.is_resident(task.key) {
        return;
    }

    // Single-flight: a foreground miss or another worker may already be
    // loading this key.
    if !core.begin_flight(task.key) {
        return;
    }

    match core.loader.load(task.key, task.deadline) {
        Ok(buffer) => {
            if task.cancel.load(Ordering::Acquire) {
                // Loaded but no longer wanted: hand the bytes to any
                // waiter, skip admission.
                core.inflight.complete(task.key, Some(buffer));
                counters.preload_cancelled.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let admitted = core.deposit_unpinned(task.key, buffer.clone()).is_ok();
            core.inflight.complete(task.key, Some(buffer));
            if admitted {
                counters.preload_completed.fetch_add(1, Ordering::Relaxed);
            }
        }
        Err(err) => {
            core.inflight.complete(task.key, None);
            counters.preload_failed.fetch_add(1, Ordering::Relaxed);
            debug!(
                key = %task.key,
                priority = ?task.priority,
                error = %err,
                "prefetch load failed"
            );

            // One retry at low priority; never propagated to foreground.
            if !task.retried && !task.cancel.load(Ordering::Acquire) {
                counters.preload_retries.fetch_add(1, Ordering::Relaxed);
                let deadline = Instant::now() + core.config.prefetch_deadline();
                let mut queue = shared.queue.lock();
                if !queue.shutdown && !queue.queued.contains_key(&task.key) {
                    push_task(&mut queue, task.key, Priority::Low, deadline, true);
                    drop(queue);
                    shared.cv.notify_all();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaled_window_directions() {
        assert_eq!(scaled_window(25, 75, Direction::Forward, 100), (25, 75));
        assert_eq!(scaled_window(25, 75, Direction::Backward, 100), (75, 25));
        assert_eq!(scaled_window(25, 75, Direction::Stationary, 100), (50, 50));
        assert_eq!(scaled_window(25, 75, Direction::Random, 100), (50, 50));
    }

    #[test]
    fn test_scaled_window_shrink() {
        assert_eq!(scaled_window(25, 75, Direction::Forward, 50), (12, 37));
        // A configured side never collapses to zero under shrink.
        assert_eq!(scaled_window(1, 1, Direction::Forward, 25), (1, 1));
        // A disabled side stays disabled.
        assert_eq!(scaled_window(0, 0, Direction::Forward, 100), (0, 0));
        assert_eq!(scaled_window(0, 0, Direction::Stationary, 100), (0, 0));
    }

    #[test]
    fn test_priority_classes() {
        assert_eq!(priority_for(1, Direction::Forward), Priority::High);
        assert_eq!(priority_for(2, Direction::Forward), Priority::High);
        assert_eq!(priority_for(3, Direction::Forward), Priority::Normal);
        assert_eq!(priority_for(10, Direction::Forward), Priority::Normal);
        assert_eq!(priority_for(11, Direction::Forward), Priority::Low);
        // Behind the predicted direction, adjacency does not outrank.
        assert_eq!(priority_for(-1, Direction::Forward), Priority::Normal);
        assert_eq!(priority_for(-1, Direction::Backward), Priority::High);
        assert_eq!(priority_for(-30, Direction::Backward), Priority::Low);
        // No preferred side while stationary.
        assert_eq!(priority_for(1, Direction::Stationary), Priority::High);
        assert_eq!(priority_for(-1, Direction::Stationary), Priority::High);
    }
}
