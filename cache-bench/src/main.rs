//! In-process frame cache benchmark — exercises the cache facade the way
//! the annotation UI would, without any GUI or decoder in the loop.

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod config;
mod workload;

use crate::config::Config;
use crate::workload::{Phase, SharedState};

use clap::Parser;
use frame_cache::{CacheEvent, Direction, FrameCache, LoadResult, Severity};
use frame_store::{FrameBuffer, FrameKey, FrameRange, PixelLayout};
use metriken::{AtomicHistogram, histogram::Histogram};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cache-bench")]
#[command(about = "In-process frame cache benchmark")]
struct Args {
    /// Path to configuration file
    config: PathBuf,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Synthetic loader: deterministic pixels, configurable decode latency.
struct SyntheticLoader {
    frame_size: usize,
    decode_delay: Option<Duration>,
}

impl frame_cache::FrameLoader for SyntheticLoader {
    fn load(&self, key: FrameKey, _deadline: Instant) -> LoadResult {
        if let Some(delay) = self.decode_delay {
            thread::sleep(delay);
        }
        let seed = key.index() as u8;
        let data: Vec<u8> = (0..self.frame_size)
            .map(|i| (i as u8).wrapping_add(seed))
            .collect();
        Ok(FrameBuffer::new(3840, 2160, PixelLayout::Bgr8, data.into()))
    }
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    print_config(&config);

    let loader = Arc::new(SyntheticLoader {
        frame_size: config.workload.frame_size,
        decode_delay: config.workload.decode_delay,
    });
    let cache = Arc::new(FrameCache::new(config.cache.clone(), loader)?);

    // Count alerts the way an embedding UI would surface them.
    let warnings = Arc::new(AtomicU64::new(0));
    let errors = Arc::new(AtomicU64::new(0));
    {
        let warnings = Arc::clone(&warnings);
        let errors = Arc::clone(&errors);
        cache.subscribe(move |event| {
            if let CacheEvent::PerformanceWarning { severity, .. } = event {
                match severity {
                    Severity::Error => errors.fetch_add(1, Ordering::Relaxed),
                    _ => warnings.fetch_add(1, Ordering::Relaxed),
                };
            }
        });
    }

    let last = config.workload.frames - 1;
    cache.project_opened(FrameRange::new(FrameKey::new(0), FrameKey::new(last)));
    cache.frame_changed(
        FrameKey::new(config.workload.frames / 2),
        None,
        Some(Direction::Forward),
    );

    let shared = Arc::new(SharedState::new());
    let latency = Arc::new(AtomicHistogram::new(7, 64));

    // Signal handler
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("failed to set signal handler");

    // Driver thread: the "UI" stepping frames.
    let config = Arc::new(config);
    let driver_handle = {
        let cache = Arc::clone(&cache);
        let shared = Arc::clone(&shared);
        let latency = Arc::clone(&latency);
        let cfg = Arc::clone(&config);
        thread::Builder::new()
            .name("driver".to_string())
            .spawn(move || workload::run_driver(&cfg, &cache, &shared, &latency))?
    };

    let warmup = config.general.warmup;
    let duration = config.general.duration;
    eprintln!("warming up for {warmup:?}...");

    let start = Instant::now();
    let report_interval = Duration::from_secs(1);
    let mut last_report = Instant::now();
    let mut last_switches = 0u64;
    let mut last_stats = cache.stats();
    let mut last_histogram: Option<Histogram> = None;
    let mut running_phase = false;

    loop {
        thread::sleep(Duration::from_millis(100));

        if !running.load(Ordering::SeqCst) {
            shared.set_phase(Phase::Stop);
            break;
        }

        let elapsed = start.elapsed();
        if elapsed >= warmup + duration {
            shared.set_phase(Phase::Stop);
            break;
        }

        if !running_phase && elapsed >= warmup {
            shared.set_phase(Phase::Running);
            running_phase = true;
            eprintln!("running for {duration:?}...");
            print_header();
            last_report = Instant::now();
            last_switches = shared.switches.load(Ordering::Relaxed);
            last_stats = cache.stats();
            last_histogram = latency.load();
        }

        if !running_phase || last_report.elapsed() < report_interval {
            continue;
        }

        let interval_secs = last_report.elapsed().as_secs_f64();
        let switches = shared.switches.load(Ordering::Relaxed);
        let stats = cache.stats();

        let delta_switches = switches - last_switches;
        let rate = delta_switches as f64 / interval_secs;

        let delta_hits = stats.hits - last_stats.hits;
        let delta_misses = stats.misses - last_stats.misses;
        let delta_gets = delta_hits + delta_misses;
        let hit_pct = if delta_gets > 0 {
            (delta_hits as f64 / delta_gets as f64) * 100.0
        } else {
            0.0
        };

        // Interval percentiles via wrapping_sub
        let current = latency.load();
        let (p50, p99, pmax) = match (&current, &last_histogram) {
            (Some(now), Some(prev)) => {
                let delta = now.wrapping_sub(prev).expect("histogram configs match");
                (
                    percentile_from_histogram(&delta, 50.0) / 1_000_000.0,
                    percentile_from_histogram(&delta, 99.0) / 1_000_000.0,
                    percentile_from_histogram(&delta, 100.0) / 1_000_000.0,
                )
            }
            _ => (0.0, 0.0, 0.0),
        };

        println!(
            "{:>8.0} {:>7.2} {:>10} {:>10} {:>9.3} {:>9.3} {:>9.3}",
            rate,
            hit_pct,
            stats.entry_count,
            stats.evictions,
            p50,
            p99,
            pmax,
        );

        last_report = Instant::now();
        last_switches = switches;
        last_stats = stats;
        last_histogram = current;
    }

    driver_handle.join().expect("driver thread panicked");

    print_summary(
        &cache,
        &shared,
        &latency,
        warnings.load(Ordering::Relaxed),
        errors.load(Ordering::Relaxed),
    );
    Ok(())
}

fn print_config(config: &Config) {
    eprintln!(
        "pattern: {} | frames: {} | frame size: {} MiB | workers: {} | budget: {} ms",
        config.workload.pattern,
        config.workload.frames,
        config.workload.frame_size / (1024 * 1024),
        config.cache.worker_count,
        config.cache.frame_switch_budget_ms,
    );
}

fn print_header() {
    println!(
        "{:>8} {:>7} {:>10} {:>10} {:>9} {:>9} {:>9}",
        "step/s", "hit%", "entries", "evictions", "p50(ms)", "p99(ms)", "max(ms)"
    );
}

fn print_summary(
    cache: &FrameCache,
    shared: &SharedState,
    latency: &AtomicHistogram,
    warnings: u64,
    errors: u64,
) {
    let stats = cache.stats();
    let switches = shared.switches.load(Ordering::Relaxed);
    let not_found = shared.not_found.load(Ordering::Relaxed);

    println!();
    println!("=== summary ===");
    println!("frame switches: {switches}");
    println!(
        "hits: {} misses: {} hit rate: {:.3}%",
        stats.hits,
        stats.misses,
        stats.hit_rate * 100.0
    );
    println!(
        "resident: {:.1} MiB in {} entries, {} evictions",
        stats.resident_bytes as f64 / (1024.0 * 1024.0),
        stats.entry_count,
        stats.evictions
    );
    println!("not found: {not_found}, warnings: {warnings}, errors: {errors}");
    print_latency_summary("frame switch", latency);
}

fn print_latency_summary(label: &str, hist: &AtomicHistogram) {
    let p50 = percentile(hist, 50.0) / 1_000_000.0;
    let p95 = percentile(hist, 95.0) / 1_000_000.0;
    let p99 = percentile(hist, 99.0) / 1_000_000.0;
    let max = percentile(hist, 100.0) / 1_000_000.0;
    println!("{label} latency (ms): p50={p50:.3} p95={p95:.3} p99={p99:.3} max={max:.3}");
}

// --- Histogram helpers ---

fn percentile(hist: &AtomicHistogram, p: f64) -> f64 {
    if let Some(snapshot) = hist.load() {
        percentile_from_histogram(&snapshot, p)
    } else {
        0.0
    }
}

fn percentile_from_histogram(hist: &Histogram, p: f64) -> f64 {
    if let Ok(Some(results)) = hist.percentiles(&[p])
        && let Some((_pct, bucket)) = results.first()
    {
        return bucket.end() as f64;
    }
    0.0
}
