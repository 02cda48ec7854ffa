//! Workload driver: moves a synthetic cursor across the project the way
//! an annotation operator would, and records per-switch latency.

use crate::config::{Config, Pattern};
use frame_cache::{CacheError, FrameCache};
use frame_store::FrameKey;
use metriken::AtomicHistogram;
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Instant;

/// Test phase, controlled by the main thread and read by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// Warmup phase — run the workload but don't record metrics.
    Warmup = 0,
    /// Main measurement phase — record metrics.
    Running = 1,
    /// Stop phase — the driver should exit.
    Stop = 2,
}

impl Phase {
    #[inline]
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Phase::Warmup,
            1 => Phase::Running,
            _ => Phase::Stop,
        }
    }
}

/// State shared between the main thread and the driver thread.
pub struct SharedState {
    phase: AtomicU8,
    pub switches: AtomicU64,
    pub not_found: AtomicU64,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Warmup as u8),
            switches: AtomicU64::new(0),
            not_found: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

/// Cursor generator for one access pattern.
struct Cursor {
    pattern: Pattern,
    frames: u32,
    position: u32,
    ascending: bool,
    rng: Xoshiro256PlusPlus,
}

impl Cursor {
    fn new(pattern: Pattern, frames: u32, seed: u64) -> Self {
        Self {
            pattern,
            frames,
            position: frames / 2,
            ascending: true,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }

    /// Advance the cursor and return the next frame to display.
    fn step(&mut self) -> FrameKey {
        const BOUNCE_STRETCH: u32 = 200;
        match self.pattern {
            Pattern::Sweep => {
                self.position = (self.position + 1) % self.frames;
            }
            Pattern::Hotspot => {
                // Mostly dwell; occasionally peek at a neighbor.
                let roll: u8 = self.rng.random_range(0..100);
                if roll >= 90 {
                    let offset = self.rng.random_range(1..=5);
                    let base = self.frames / 2;
                    self.position = if roll % 2 == 0 {
                        (base + offset).min(self.frames - 1)
                    } else {
                        base.saturating_sub(offset)
                    };
                } else {
                    self.position = self.frames / 2;
                }
            }
            Pattern::Random => {
                self.position = self.rng.random_range(0..self.frames);
            }
            Pattern::Bounce => {
                if self.ascending {
                    self.position += 1;
                    if self.position % BOUNCE_STRETCH == 0 || self.position == self.frames - 1 {
                        self.ascending = false;
                    }
                } else {
                    self.position = self.position.saturating_sub(1);
                    if self.position % BOUNCE_STRETCH == 0 {
                        self.ascending = true;
                    }
                }
                self.position %= self.frames;
            }
        }
        FrameKey::new(self.position)
    }
}

/// Run the foreground driver: one thread stepping frames like the UI.
pub fn run_driver(
    config: &Config,
    cache: &Arc<FrameCache>,
    shared: &SharedState,
    latency: &AtomicHistogram,
) {
    let mut cursor = Cursor::new(
        config.workload.pattern,
        config.workload.frames,
        config.workload.seed,
    );
    let pace = config.general.pace;

    loop {
        match shared.phase() {
            Phase::Stop => break,
            Phase::Warmup | Phase::Running => {}
        }
        let recording = shared.phase() == Phase::Running;

        let key = cursor.step();
        let start = Instant::now();
        let result = cache.get(key);
        let elapsed_ns = start.elapsed().as_nanos() as u64;

        match result {
            Ok(borrow) => drop(borrow),
            Err(CacheError::NotFound) => {
                if recording {
                    shared.not_found.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(err) => {
                tracing::error!(key = %key, error = %err, "unexpected cache error");
                break;
            }
        }

        if recording {
            shared.switches.fetch_add(1, Ordering::Relaxed);
            let _ = latency.increment(elapsed_ns);
        }

        if let Some(pace) = pace {
            std::thread::sleep(pace);
        }
    }
}
