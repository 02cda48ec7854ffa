//! Access-pattern prediction.
//!
//! A ring buffer of recent accesses feeds cheap heuristics that bias the
//! prefetch window: dominant direction and stride for stepping users,
//! `Stationary` for dwell-and-annotate, `Random` for scrubbing. The
//! predictor only mutates its own buffers and completes in O(K).

use frame_store::FrameKey;
use std::collections::VecDeque;
use std::time::Instant;

/// Minimum ring occupancy before direction heuristics apply.
const MIN_SAMPLES: usize = 4;

/// Fraction of same-sign deltas required to call a direction.
const DIRECTION_AGREEMENT: f64 = 0.70;

/// Median |delta| above this is jumping, not stepping.
const MAX_STEP_STRIDE: u64 = 3;

/// Share of one key in the ring that means the user is dwelling.
const STATIONARY_SHARE: f64 = 0.30;

/// |delta| variance above this reads as random scrubbing.
const RANDOM_VARIANCE: f64 = 1000.0;

/// Confidence reported for the `Random` classification.
const LOW_CONFIDENCE: f64 = 0.25;

/// Predicted navigation direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Stepping toward higher keys.
    Forward,
    /// Stepping toward lower keys.
    Backward,
    /// Dwelling on one frame.
    Stationary,
    /// No recognizable pattern.
    Random,
}

/// One recorded access.
#[derive(Debug, Clone, Copy)]
pub struct AccessEvent {
    /// The accessed frame.
    pub key: FrameKey,
    /// When the access happened.
    pub at: Instant,
}

/// Output of a prediction request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    /// Dominant direction.
    pub direction: Direction,
    /// Typical step size in frames (≥ 1 for directional patterns).
    pub stride: u64,
    /// Heuristic confidence in `[0, 1]`.
    pub confidence: f64,
}

impl Prediction {
    fn stationary(confidence: f64) -> Self {
        Self {
            direction: Direction::Stationary,
            stride: 0,
            confidence,
        }
    }
}

/// Sliding-window access predictor.
#[derive(Debug)]
pub struct AccessPredictor {
    window: usize,
    events: VecDeque<AccessEvent>,
}

impl AccessPredictor {
    /// Create a predictor keeping the last `window` accesses.
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            events: VecDeque::with_capacity(window),
        }
    }

    /// Record an access; the oldest event drops once the ring is full.
    pub fn record(&mut self, key: FrameKey) {
        if self.events.len() == self.window {
            self.events.pop_front();
        }
        self.events.push_back(AccessEvent {
            key,
            at: Instant::now(),
        });
    }

    /// Forget all recorded accesses.
    pub fn reset(&mut self) {
        self.events.clear();
    }

    /// Number of events currently in the ring.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Classify the recent access pattern.
    pub fn predict(&self) -> Prediction {
        if self.events.len() < MIN_SAMPLES {
            return Prediction::stationary(0.0);
        }

        // Dwell detection: one key dominating the ring.
        if let Some(share) = self.dominant_key_share()
            && share > STATIONARY_SHARE
        {
            return Prediction::stationary(share);
        }

        let deltas: Vec<i64> = self
            .events
            .iter()
            .zip(self.events.iter().skip(1))
            .map(|(a, b)| b.key.distance_from(a.key))
            .filter(|d| *d != 0)
            .collect();
        if deltas.is_empty() {
            return Prediction::stationary(1.0);
        }

        let forward = deltas.iter().filter(|d| **d > 0).count();
        let backward = deltas.len() - forward;
        let agreement = forward.max(backward) as f64 / deltas.len() as f64;

        let mut magnitudes: Vec<u64> = deltas.iter().map(|d| d.unsigned_abs()).collect();
        let mid = magnitudes.len() / 2;
        let (_, median, _) = magnitudes.select_nth_unstable(mid);
        let median = *median;

        if agreement >= DIRECTION_AGREEMENT && median <= MAX_STEP_STRIDE {
            let direction = if forward >= backward {
                Direction::Forward
            } else {
                Direction::Backward
            };
            return Prediction {
                direction,
                stride: median.max(1),
                confidence: agreement,
            };
        }

        let mean = magnitudes.iter().sum::<u64>() as f64 / magnitudes.len() as f64;
        let variance = magnitudes
            .iter()
            .map(|m| {
                let d = *m as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / magnitudes.len() as f64;
        if variance > RANDOM_VARIANCE {
            return Prediction {
                direction: Direction::Random,
                stride: 0,
                confidence: LOW_CONFIDENCE,
            };
        }

        Prediction {
            direction: Direction::Random,
            stride: median.max(1),
            confidence: LOW_CONFIDENCE,
        }
    }

    fn dominant_key_share(&self) -> Option<f64> {
        let mut counts: ahash::AHashMap<FrameKey, usize> = ahash::AHashMap::new();
        for event in &self.events {
            *counts.entry(event.key).or_insert(0) += 1;
        }
        counts
            .values()
            .max()
            .map(|max| *max as f64 / self.events.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_all(predictor: &mut AccessPredictor, keys: &[u32]) {
        for k in keys {
            predictor.record(FrameKey::new(*k));
        }
    }

    #[test]
    fn test_too_few_samples_is_stationary() {
        let mut predictor = AccessPredictor::new(64);
        record_all(&mut predictor, &[1, 2]);
        let p = predictor.predict();
        assert_eq!(p.direction, Direction::Stationary);
        assert_eq!(p.confidence, 0.0);
    }

    #[test]
    fn test_sequential_forward() {
        let mut predictor = AccessPredictor::new(64);
        record_all(&mut predictor, &(100..120).collect::<Vec<_>>());
        let p = predictor.predict();
        assert_eq!(p.direction, Direction::Forward);
        assert_eq!(p.stride, 1);
        assert!(p.confidence >= 0.99);
    }

    #[test]
    fn test_sequential_backward() {
        let mut predictor = AccessPredictor::new(64);
        record_all(&mut predictor, &(100..120).rev().collect::<Vec<_>>());
        let p = predictor.predict();
        assert_eq!(p.direction, Direction::Backward);
        assert_eq!(p.stride, 1);
    }

    #[test]
    fn test_strided_forward() {
        let mut predictor = AccessPredictor::new(64);
        record_all(&mut predictor, &[10, 13, 16, 19, 22, 25]);
        let p = predictor.predict();
        assert_eq!(p.direction, Direction::Forward);
        assert_eq!(p.stride, 3);
    }

    #[test]
    fn test_forward_with_occasional_backtrack() {
        let mut predictor = AccessPredictor::new(64);
        record_all(&mut predictor, &[10, 11, 12, 11, 13, 14, 15, 16, 17, 18]);
        let p = predictor.predict();
        assert_eq!(p.direction, Direction::Forward);
        assert!(p.confidence >= DIRECTION_AGREEMENT);
    }

    #[test]
    fn test_dwelling_is_stationary() {
        let mut predictor = AccessPredictor::new(64);
        record_all(&mut predictor, &[50, 50, 50, 51, 50, 50, 52, 50]);
        let p = predictor.predict();
        assert_eq!(p.direction, Direction::Stationary);
        assert!(p.confidence > STATIONARY_SHARE);
    }

    #[test]
    fn test_scrubbing_is_random() {
        let mut predictor = AccessPredictor::new(64);
        record_all(&mut predictor, &[10, 900, 45, 3000, 200, 7000, 12, 4500]);
        let p = predictor.predict();
        assert_eq!(p.direction, Direction::Random);
        assert!(p.confidence <= LOW_CONFIDENCE);
    }

    #[test]
    fn test_ring_drops_oldest() {
        let mut predictor = AccessPredictor::new(8);
        // Old backward phase, overwritten by a forward phase.
        record_all(&mut predictor, &(0..8).rev().collect::<Vec<_>>());
        record_all(&mut predictor, &(100..108).collect::<Vec<_>>());
        assert_eq!(predictor.len(), 8);
        let p = predictor.predict();
        assert_eq!(p.direction, Direction::Forward);
    }

    #[test]
    fn test_reset() {
        let mut predictor = AccessPredictor::new(8);
        record_all(&mut predictor, &[1, 2, 3, 4]);
        predictor.reset();
        assert!(predictor.is_empty());
        assert_eq!(predictor.predict().confidence, 0.0);
    }
}
