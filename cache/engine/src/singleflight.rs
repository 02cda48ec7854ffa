//! Single-flight coordination for frame loads.
//!
//! At most one loader invocation exists per key at any moment. The first
//! caller to register becomes the leader and runs the loader; concurrent
//! misses for the same key subscribe to the leader's one-shot result and
//! wait, bounded by their own remaining budget. Preload workers register
//! here too, so a foreground miss can join a prefetch already in flight
//! instead of re-issuing the load.

use ahash::RandomState;
use frame_store::{FrameBuffer, FrameKey};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug)]
enum FlightState {
    Pending,
    Done(Option<FrameBuffer>),
}

/// A load in progress; waiters block on `cv`.
#[derive(Debug)]
pub struct Flight {
    state: Mutex<FlightState>,
    cv: Condvar,
}

impl Flight {
    fn new() -> Self {
        Self {
            state: Mutex::new(FlightState::Pending),
            cv: Condvar::new(),
        }
    }

    /// Wait for the result until `deadline`.
    ///
    /// `Some(result)` when the flight completed (`None` inside means the
    /// load failed); `None` when the deadline expired first.
    pub fn wait_until(&self, deadline: Instant) -> Option<Option<FrameBuffer>> {
        let mut state = self.state.lock();
        loop {
            if let FlightState::Done(result) = &*state {
                return Some(result.clone());
            }
            if self.cv.wait_until(&mut state, deadline).timed_out() {
                return match &*state {
                    FlightState::Done(result) => Some(result.clone()),
                    FlightState::Pending => None,
                };
            }
        }
    }
}

/// Outcome of registering interest in a key.
pub enum Registration {
    /// This caller runs the loader and must publish the result.
    Leader,
    /// Another caller is already loading; wait on the flight.
    Follower(Arc<Flight>),
}

/// Map of in-flight loads, one per key.
#[derive(Debug, Default)]
pub struct InFlightTable {
    flights: Mutex<HashMap<FrameKey, Arc<Flight>, RandomState>>,
}

impl InFlightTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `key`.
    pub fn register(&self, key: FrameKey) -> Registration {
        let mut flights = self.flights.lock();
        if let Some(flight) = flights.get(&key) {
            return Registration::Follower(Arc::clone(flight));
        }
        flights.insert(key, Arc::new(Flight::new()));
        Registration::Leader
    }

    /// Whether a load for `key` is in flight.
    pub fn contains(&self, key: FrameKey) -> bool {
        self.flights.lock().contains_key(&key)
    }

    /// Publish the leader's result and wake all waiters.
    ///
    /// `None` signals a failed load. The flight is removed; the next
    /// miss for this key starts fresh.
    pub fn complete(&self, key: FrameKey, result: Option<FrameBuffer>) {
        let flight = self.flights.lock().remove(&key);
        if let Some(flight) = flight {
            *flight.state.lock() = FlightState::Done(result);
            flight.cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame_store::PixelLayout;
    use std::thread;
    use std::time::Duration;

    fn buffer() -> FrameBuffer {
        FrameBuffer::new(1, 1, PixelLayout::Gray8, vec![9u8].into())
    }

    #[test]
    fn test_first_caller_leads() {
        let table = InFlightTable::new();
        assert!(matches!(
            table.register(FrameKey::new(1)),
            Registration::Leader
        ));
        assert!(matches!(
            table.register(FrameKey::new(1)),
            Registration::Follower(_)
        ));
        // Distinct keys fly independently.
        assert!(matches!(
            table.register(FrameKey::new(2)),
            Registration::Leader
        ));
    }

    #[test]
    fn test_followers_receive_result() {
        let table = Arc::new(InFlightTable::new());
        let key = FrameKey::new(7);
        assert!(matches!(table.register(key), Registration::Leader));

        let mut followers = Vec::new();
        for _ in 0..4 {
            let Registration::Follower(flight) = table.register(key) else {
                panic!("expected follower");
            };
            followers.push(thread::spawn(move || {
                flight.wait_until(Instant::now() + Duration::from_secs(5))
            }));
        }

        thread::sleep(Duration::from_millis(20));
        table.complete(key, Some(buffer()));

        for follower in followers {
            let result = follower.join().unwrap();
            assert!(result.unwrap().is_some());
        }
        assert!(!table.contains(key));
    }

    #[test]
    fn test_followers_observe_failure() {
        let table = InFlightTable::new();
        let key = FrameKey::new(3);
        table.register(key);
        let Registration::Follower(flight) = table.register(key) else {
            panic!("expected follower");
        };

        table.complete(key, None);
        let result = flight.wait_until(Instant::now() + Duration::from_millis(100));
        assert_eq!(result.map(|r| r.is_none()), Some(true));
    }

    #[test]
    fn test_wait_deadline_expires() {
        let table = InFlightTable::new();
        let key = FrameKey::new(4);
        table.register(key);
        let Registration::Follower(flight) = table.register(key) else {
            panic!("expected follower");
        };

        let result = flight.wait_until(Instant::now() + Duration::from_millis(10));
        assert!(result.is_none());
        // The leader is still responsible for completing.
        assert!(table.contains(key));
    }

    #[test]
    fn test_key_reusable_after_completion() {
        let table = InFlightTable::new();
        let key = FrameKey::new(5);
        table.register(key);
        table.complete(key, Some(buffer()));
        assert!(matches!(table.register(key), Registration::Leader));
    }
}
