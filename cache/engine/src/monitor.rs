//! Background monitor thread.
//!
//! One thread drives everything that must never block the foreground
//! path: the governor's pressure poll (200 ms cadence), the 1 s
//! `memory_usage` heartbeat, hit-rate rollups, and corrective actions
//! after sustained latency violations.

use crate::events::{CacheEvent, PauseReason, Severity};
use crate::facade::CacheCore;
use crate::governor::PressureChange;
use crate::preload::PreloadScheduler;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::warn;

/// Pressure poll cadence; the memory heartbeat fires every fifth tick.
const TICK: Duration = Duration::from_millis(200);
const HEARTBEAT_TICKS: u32 = 5;

/// Metric name carried by the compound sustained-violation alert.
const SUSTAINED_METRIC: &str = "sustained_frame_switch_violations";

struct Shutdown {
    requested: Mutex<bool>,
    cv: Condvar,
}

/// Handle to the monitor thread.
pub(crate) struct Monitor {
    shutdown: Arc<Shutdown>,
    handle: Option<JoinHandle<()>>,
}

impl Monitor {
    /// Start the monitor against the shared core and scheduler.
    pub(crate) fn start(core: Arc<CacheCore>, scheduler: Arc<PreloadScheduler>) -> Self {
        let shutdown = Arc::new(Shutdown {
            requested: Mutex::new(false),
            cv: Condvar::new(),
        });
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("cache-monitor".to_string())
            .spawn(move || run(&core, &scheduler, &thread_shutdown))
            .expect("failed to spawn cache monitor");
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stop and join the monitor thread.
    pub(crate) fn shutdown(&mut self) {
        *self.shutdown.requested.lock() = true;
        self.shutdown.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(core: &Arc<CacheCore>, scheduler: &Arc<PreloadScheduler>, shutdown: &Shutdown) {
    let mut tick = 0u32;
    loop {
        {
            let mut requested = shutdown.requested.lock();
            if *requested {
                return;
            }
            shutdown.cv.wait_for(&mut requested, TICK);
            if *requested {
                return;
            }
        }
        tick = tick.wrapping_add(1);

        match core.governor.poll_pressure(Instant::now()) {
            Some(PressureChange::Pause) => scheduler.pause(PauseReason::MemoryPressure),
            Some(PressureChange::Resume) => scheduler.resume(),
            None => {}
        }

        if core.latency.take_corrective() {
            apply_corrective(core, scheduler);
        }

        if tick % HEARTBEAT_TICKS == 0 {
            core.publish_memory_usage();
            core.latency.check_hit_rate(&core.events);
        }
    }
}

/// Sustained latency violations: free memory down to the eviction
/// target, halve the prefetch window, and raise one compound alert.
fn apply_corrective(core: &Arc<CacheCore>, scheduler: &Arc<PreloadScheduler>) {
    let evicted = {
        let mut store = core.store.lock();
        core.governor.force_cleanup(&mut store, &core.counters)
    };
    scheduler.shrink_window();

    warn!(
        evicted = evicted.len(),
        resident_bytes = core.governor.resident_bytes(),
        "sustained latency violations; cache cleaned and prefetch window shrunk"
    );
    core.events.publish(CacheEvent::PerformanceWarning {
        metric: SUSTAINED_METRIC,
        value: evicted.len() as f64,
        threshold: 0.0,
        severity: Severity::Error,
    });
    core.publish_memory_usage();
}
