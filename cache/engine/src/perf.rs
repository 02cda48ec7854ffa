//! Frame-switch latency measurement and the alert pipeline.
//!
//! Every `get` records its elapsed time and hit/miss status into a
//! bounded ring plus a nanosecond histogram (not globally registered).
//! Threshold crossings publish `performance_warning` events immediately;
//! sustained violations arm a corrective flag that the monitor thread
//! consumes off the foreground path.

use crate::events::{CacheEvent, EventBus, Severity};
use metriken::AtomicHistogram;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

/// Ring capacity for per-call samples.
const SAMPLE_RING: usize = 1000;

/// Short window for "recent" rolling statistics.
const RECENT_WINDOW: usize = 100;

/// Minimum accesses before the hit-rate alert can fire.
const HIT_RATE_WINDOW: usize = 200;

/// Rolling hit rate below this publishes `cache_hit_rate_low`.
const HIT_RATE_FLOOR: f64 = 0.95;

/// Error-severity violations within [`VIOLATION_WINDOW`] that trigger
/// corrective actions.
const VIOLATION_TRIGGER: usize = 3;

/// Window for counting sustained violations.
const VIOLATION_WINDOW: Duration = Duration::from_secs(10);

/// Metric name used in latency alerts.
pub const FRAME_SWITCH_METRIC: &str = "frame_switch_ms";

/// One measured `get`.
#[derive(Debug, Clone, Copy)]
struct GetSample {
    hit: bool,
    elapsed: Duration,
}

/// Rolling latency statistics over a sample window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RollingStats {
    /// Samples in the window.
    pub samples: usize,
    /// Arithmetic mean.
    pub mean: Duration,
    /// Median.
    pub p50: Duration,
    /// 95th percentile.
    pub p95: Duration,
    /// 99th percentile.
    pub p99: Duration,
    /// Maximum.
    pub max: Duration,
}

/// Measures the frame-switch contract and raises alerts.
pub struct LatencyTracker {
    warn_threshold: Duration,
    hard_threshold: Duration,
    ring: Mutex<VecDeque<GetSample>>,
    violations: Mutex<VecDeque<Instant>>,
    corrective_armed: AtomicBool,
    hit_rate_alerted: AtomicBool,
    histogram: AtomicHistogram,
}

impl LatencyTracker {
    /// Create a tracker with the configured thresholds.
    pub fn new(warn_threshold: Duration, hard_threshold: Duration) -> Self {
        Self {
            warn_threshold,
            hard_threshold,
            ring: Mutex::new(VecDeque::with_capacity(SAMPLE_RING)),
            violations: Mutex::new(VecDeque::new()),
            corrective_armed: AtomicBool::new(false),
            hit_rate_alerted: AtomicBool::new(false),
            histogram: AtomicHistogram::new(7, 64),
        }
    }

    /// Record one completed `get` and publish threshold alerts.
    pub fn record(&self, hit: bool, elapsed: Duration, events: &EventBus) {
        let _ = self.histogram.increment(elapsed.as_nanos() as u64);

        {
            let mut ring = self.ring.lock();
            if ring.len() == SAMPLE_RING {
                ring.pop_front();
            }
            ring.push_back(GetSample { hit, elapsed });
        }

        if elapsed > self.hard_threshold {
            warn!(
                elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                hit, "frame switch exceeded the latency contract"
            );
            events.publish(CacheEvent::PerformanceWarning {
                metric: FRAME_SWITCH_METRIC,
                value: elapsed.as_secs_f64() * 1000.0,
                threshold: self.hard_threshold.as_secs_f64() * 1000.0,
                severity: Severity::Error,
            });
            self.note_violation(Instant::now());
        } else if elapsed > self.warn_threshold {
            events.publish(CacheEvent::PerformanceWarning {
                metric: FRAME_SWITCH_METRIC,
                value: elapsed.as_secs_f64() * 1000.0,
                threshold: self.warn_threshold.as_secs_f64() * 1000.0,
                severity: Severity::Warning,
            });
        }
    }

    /// Rolling statistics over the full ring.
    pub fn rolling(&self) -> RollingStats {
        let ring = self.ring.lock();
        stats_over(ring.iter())
    }

    /// Rolling statistics over the most recent accesses.
    pub fn recent(&self) -> RollingStats {
        let ring = self.ring.lock();
        let skip = ring.len().saturating_sub(RECENT_WINDOW);
        stats_over(ring.iter().skip(skip))
    }

    /// Hit rate over the ring, if enough accesses were recorded.
    pub fn rolling_hit_rate(&self) -> Option<(f64, usize)> {
        let ring = self.ring.lock();
        if ring.len() < HIT_RATE_WINDOW {
            return None;
        }
        let hits = ring.iter().filter(|s| s.hit).count();
        Some((hits as f64 / ring.len() as f64, ring.len()))
    }

    /// Hit-rate alert check, edge-triggered; called by the monitor.
    pub fn check_hit_rate(&self, events: &EventBus) {
        let Some((rate, window)) = self.rolling_hit_rate() else {
            return;
        };
        if rate < HIT_RATE_FLOOR {
            if !self.hit_rate_alerted.swap(true, Ordering::AcqRel) {
                events.publish(CacheEvent::HitRateLow {
                    hit_rate: rate,
                    window,
                });
            }
        } else {
            self.hit_rate_alerted.store(false, Ordering::Release);
        }
    }

    /// Consume the corrective flag; true at most once per arming.
    pub fn take_corrective(&self) -> bool {
        self.corrective_armed.swap(false, Ordering::AcqRel)
    }

    /// Nanosecond histogram of all recorded calls.
    pub fn histogram(&self) -> &AtomicHistogram {
        &self.histogram
    }

    fn note_violation(&self, now: Instant) {
        let mut violations = self.violations.lock();
        violations.push_back(now);
        while let Some(front) = violations.front() {
            if now.duration_since(*front) > VIOLATION_WINDOW {
                violations.pop_front();
            } else {
                break;
            }
        }
        if violations.len() >= VIOLATION_TRIGGER {
            violations.clear();
            self.corrective_armed.store(true, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for LatencyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencyTracker")
            .field("warn_threshold", &self.warn_threshold)
            .field("hard_threshold", &self.hard_threshold)
            .field("samples", &self.ring.lock().len())
            .finish()
    }
}

fn stats_over<'a>(samples: impl Iterator<Item = &'a GetSample>) -> RollingStats {
    let mut elapsed: Vec<Duration> = samples.map(|s| s.elapsed).collect();
    if elapsed.is_empty() {
        return RollingStats::default();
    }
    elapsed.sort_unstable();

    let total: Duration = elapsed.iter().sum();
    let n = elapsed.len();
    RollingStats {
        samples: n,
        mean: total / n as u32,
        p50: elapsed[percentile_index(n, 50.0)],
        p95: elapsed[percentile_index(n, 95.0)],
        p99: elapsed[percentile_index(n, 99.0)],
        max: elapsed[n - 1],
    }
}

fn percentile_index(n: usize, p: f64) -> usize {
    let idx = ((p / 100.0) * n as f64).ceil() as usize;
    idx.saturating_sub(1).min(n - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::Arc;

    fn collector(bus: &EventBus) -> Arc<PlMutex<Vec<CacheEvent>>> {
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(move |event| sink.lock().push(event.clone()));
        seen
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_fast_get_publishes_nothing() {
        let tracker = LatencyTracker::new(ms(45), ms(50));
        let bus = EventBus::new();
        let seen = collector(&bus);

        tracker.record(true, ms(3), &bus);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_warn_threshold_publishes_warning() {
        let tracker = LatencyTracker::new(ms(45), ms(50));
        let bus = EventBus::new();
        let seen = collector(&bus);

        tracker.record(false, ms(47), &bus);
        let events = seen.lock();
        assert_eq!(events.len(), 1);
        match &events[0] {
            CacheEvent::PerformanceWarning {
                severity, metric, ..
            } => {
                assert_eq!(*severity, Severity::Warning);
                assert_eq!(*metric, FRAME_SWITCH_METRIC);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_hard_threshold_publishes_error() {
        let tracker = LatencyTracker::new(ms(45), ms(50));
        let bus = EventBus::new();
        let seen = collector(&bus);

        tracker.record(false, ms(80), &bus);
        let events = seen.lock();
        match &events[0] {
            CacheEvent::PerformanceWarning { severity, .. } => {
                assert_eq!(*severity, Severity::Error)
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_sustained_violations_arm_corrective() {
        let tracker = LatencyTracker::new(ms(45), ms(50));
        let bus = EventBus::new();

        tracker.record(false, ms(60), &bus);
        tracker.record(false, ms(60), &bus);
        assert!(!tracker.take_corrective());

        tracker.record(false, ms(60), &bus);
        assert!(tracker.take_corrective());
        // Consumed; not armed again until three fresh violations.
        assert!(!tracker.take_corrective());
    }

    #[test]
    fn test_rolling_stats() {
        let tracker = LatencyTracker::new(ms(45), ms(50));
        let bus = EventBus::new();
        for i in 1..=100 {
            tracker.record(true, ms(i), &bus);
        }

        let stats = tracker.rolling();
        assert_eq!(stats.samples, 100);
        assert_eq!(stats.p50, ms(50));
        assert_eq!(stats.p95, ms(95));
        assert_eq!(stats.p99, ms(99));
        assert_eq!(stats.max, ms(100));
    }

    #[test]
    fn test_ring_is_bounded() {
        let tracker = LatencyTracker::new(ms(45), ms(50));
        let bus = EventBus::new();
        for _ in 0..(SAMPLE_RING + 500) {
            tracker.record(true, ms(1), &bus);
        }
        assert_eq!(tracker.rolling().samples, SAMPLE_RING);
    }

    #[test]
    fn test_hit_rate_alert_is_edge_triggered() {
        let tracker = LatencyTracker::new(ms(45), ms(50));
        let bus = EventBus::new();
        let seen = collector(&bus);

        // 200 accesses at 50% hit rate.
        for i in 0..HIT_RATE_WINDOW {
            tracker.record(i % 2 == 0, ms(1), &bus);
        }
        tracker.check_hit_rate(&bus);
        tracker.check_hit_rate(&bus);

        let low_events = seen
            .lock()
            .iter()
            .filter(|e| matches!(e, CacheEvent::HitRateLow { .. }))
            .count();
        assert_eq!(low_events, 1);
    }

    #[test]
    fn test_hit_rate_needs_full_window() {
        let tracker = LatencyTracker::new(ms(45), ms(50));
        let bus = EventBus::new();
        for _ in 0..(HIT_RATE_WINDOW - 1) {
            tracker.record(false, ms(1), &bus);
        }
        assert!(tracker.rolling_hit_rate().is_none());
    }

    #[test]
    fn test_recent_window() {
        let tracker = LatencyTracker::new(ms(45), ms(50));
        let bus = EventBus::new();
        for _ in 0..500 {
            tracker.record(true, ms(1), &bus);
        }
        for _ in 0..RECENT_WINDOW {
            tracker.record(true, ms(10), &bus);
        }
        assert_eq!(tracker.recent().p50, ms(10));
        assert!(tracker.rolling().p50 < ms(10));
    }
}
