//! Structured cache events and the in-process alert bus.
//!
//! The cache publishes typed events rather than free text; consumers
//! register callbacks and match on the variants they care about. Event
//! names are stable strings so bus bridges can route by name.

use frame_store::FrameKey;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Informational.
    Info,
    /// Contract at risk (e.g. a get over the warn threshold).
    Warning,
    /// Contract violated.
    Error,
}

/// Why preloading was paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    /// Resident bytes stayed above the soft limit past the grace interval.
    MemoryPressure,
    /// The engine is shutting down.
    Shutdown,
}

/// Events published by the cache.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// A `get` was served from resident state.
    CacheHit {
        /// The requested frame.
        key: FrameKey,
        /// Total elapsed time for the call.
        elapsed: Duration,
    },
    /// A `get` required a loader invocation.
    CacheMiss {
        /// The requested frame.
        key: FrameKey,
        /// Time spent in the loader.
        load_elapsed: Duration,
    },
    /// Byte-budget telemetry, emitted on admissions and on a 1 s timer.
    MemoryUsage {
        /// Bytes currently resident.
        resident_bytes: u64,
        /// Configured hard limit.
        hard_limit_bytes: u64,
        /// `resident_bytes / hard_limit_bytes`.
        usage_ratio: f64,
    },
    /// A measured value crossed a configured threshold.
    PerformanceWarning {
        /// Name of the violated metric (e.g. `frame_switch_ms`).
        metric: &'static str,
        /// Observed value.
        value: f64,
        /// Configured threshold.
        threshold: f64,
        /// How bad it is.
        severity: Severity,
    },
    /// Rolling hit rate dropped below the contract floor.
    HitRateLow {
        /// Observed hit rate over the window.
        hit_rate: f64,
        /// Number of accesses in the window.
        window: usize,
    },
    /// Background preloading paused.
    PreloadPaused {
        /// Why.
        reason: PauseReason,
    },
    /// Background preloading resumed.
    PreloadResumed,
}

impl CacheEvent {
    /// Stable event name for routing.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CacheHit { .. } => "cache_hit",
            Self::CacheMiss { .. } => "cache_miss",
            Self::MemoryUsage { .. } => "memory_usage",
            Self::PerformanceWarning { .. } => "performance_warning",
            Self::HitRateLow { .. } => "cache_hit_rate_low",
            Self::PreloadPaused { .. } => "preload_paused",
            Self::PreloadResumed => "preload_resumed",
        }
    }
}

type Subscriber = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

/// Fan-out bus for cache events.
///
/// Subscribers are invoked synchronously on the publishing thread, so
/// callbacks must be cheap; anything heavy belongs behind a channel on
/// the consumer side.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for all events.
    pub fn subscribe<F>(&self, f: F)
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.subscribers.write().push(Arc::new(f));
    }

    /// Publish an event to every subscriber.
    pub fn publish(&self, event: CacheEvent) {
        let subscribers = self.subscribers.read();
        for subscriber in subscribers.iter() {
            subscriber(&event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..2 {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |event| seen.lock().push(event.name()));
        }

        bus.publish(CacheEvent::PreloadResumed);
        assert_eq!(seen.lock().as_slice(), ["preload_resumed"; 2]);
    }

    #[test]
    fn test_event_names() {
        let hit = CacheEvent::CacheHit {
            key: FrameKey::new(1),
            elapsed: Duration::from_millis(1),
        };
        assert_eq!(hit.name(), "cache_hit");

        let usage = CacheEvent::MemoryUsage {
            resident_bytes: 1,
            hard_limit_bytes: 2,
            usage_ratio: 0.5,
        };
        assert_eq!(usage.name(), "memory_usage");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
    }
}
