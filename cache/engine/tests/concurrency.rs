//! Concurrency behavior: single-flight coalescing, parallel readers, and
//! borrow lifetimes across threads.

use frame_cache::{CacheConfig, FrameCache, FrameLoader, LoadResult};
use frame_store::{FrameBuffer, FrameKey, FrameRange, PixelLayout};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

/// Loader that counts invocations and can stall to widen race windows.
struct CountingLoader {
    delay: Duration,
    loads: AtomicU64,
}

impl CountingLoader {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            loads: AtomicU64::new(0),
        }
    }

    fn loads(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }
}

impl frame_cache::FrameLoader for CountingLoader {
    fn load(&self, key: FrameKey, _deadline: Instant) -> LoadResult {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        Ok(FrameBuffer::new(
            8,
            8,
            PixelLayout::Gray8,
            vec![key.index() as u8; 64].into(),
        ))
    }
}

fn quiet_config() -> CacheConfig {
    CacheConfig {
        preload_back: 0,
        preload_forward: 0,
        ..Default::default()
    }
}

fn key(i: u32) -> FrameKey {
    FrameKey::new(i)
}

#[test]
fn test_concurrent_misses_share_one_load() {
    let loader = Arc::new(CountingLoader::new(Duration::from_millis(20)));
    let cache = Arc::new(FrameCache::new(quiet_config(), Arc::clone(&loader) as Arc<dyn FrameLoader>).unwrap());
    cache.project_opened(FrameRange::new(key(1), key(100)));

    let barrier = Arc::new(Barrier::new(10));
    let mut handles = Vec::new();
    for _ in 0..10 {
        let cache = Arc::clone(&cache);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            cache.get(key(7)).map(|borrow| borrow.data().to_vec())
        }));
    }

    let mut successes = 0;
    for handle in handles {
        let result = handle.join().unwrap();
        if let Ok(data) = result {
            assert_eq!(data, vec![7u8; 64]);
            successes += 1;
        }
    }
    assert_eq!(successes, 10, "every waiter should receive the frame");
    assert_eq!(loader.loads(), 1, "misses must coalesce into one load");
}

#[test]
fn test_concurrent_reads_of_distinct_keys() {
    let loader = Arc::new(CountingLoader::new(Duration::ZERO));
    let cache = Arc::new(FrameCache::new(quiet_config(), Arc::clone(&loader) as Arc<dyn FrameLoader>).unwrap());
    cache.project_opened(FrameRange::new(key(1), key(100)));

    for i in 1..=8 {
        drop(cache.get(key(i)).unwrap());
    }
    let loads_after_warm = loader.loads();

    let barrier = Arc::new(Barrier::new(8));
    let mut handles = Vec::new();
    for i in 1..=8u32 {
        let cache = Arc::clone(&cache);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for _ in 0..200 {
                let borrow = cache.get(key(i)).unwrap();
                assert_eq!(borrow.data()[0], i as u8);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(loader.loads(), loads_after_warm, "warm reads must not load");
    let stats = cache.stats();
    assert_eq!(stats.hits, 8 * 200 + 8 - stats.misses);
}

#[test]
fn test_borrow_travels_across_threads() {
    let cache = Arc::new(
        FrameCache::new(quiet_config(), Arc::new(CountingLoader::new(Duration::ZERO))).unwrap(),
    );
    cache.project_opened(FrameRange::new(key(1), key(100)));

    let borrow = cache.get(key(5)).unwrap();
    let handle = thread::spawn(move || {
        assert_eq!(borrow.key(), key(5));
        assert_eq!(borrow.data()[0], 5);
        // Dropped here, on a different thread than it was created on.
    });
    handle.join().unwrap();
    assert!(cache.contains(key(5)));
}

#[test]
fn test_mixed_churn_keeps_invariants() {
    let frame_size = 64 * 1024u64;
    let config = CacheConfig {
        hard_limit_bytes: 40 * frame_size,
        soft_limit_bytes: 35 * frame_size,
        target_after_eviction_bytes: 30 * frame_size,
        preload_back: 0,
        preload_forward: 0,
        ..Default::default()
    };
    struct SizedLoader;
    impl frame_cache::FrameLoader for SizedLoader {
        fn load(&self, key: FrameKey, _deadline: Instant) -> LoadResult {
            Ok(FrameBuffer::new(
                128,
                128,
                PixelLayout::Rgba8,
                vec![key.index() as u8; 64 * 1024].into(),
            ))
        }
    }
    let cache = Arc::new(FrameCache::new(config, Arc::new(SizedLoader)).unwrap());
    cache.project_opened(FrameRange::new(key(1), key(500)));

    let mut handles = Vec::new();
    for t in 0..4u32 {
        let cache = Arc::clone(&cache);
        handles.push(thread::spawn(move || {
            for round in 0..200u32 {
                let k = key(1 + (t * 97 + round * 13) % 500);
                match cache.get(k) {
                    Ok(borrow) => {
                        assert_eq!(borrow.data()[0], k.index() as u8);
                        if round % 7 == 0 {
                            cache.invalidate(k);
                        }
                    }
                    Err(err) => panic!("unexpected get error: {err}"),
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = cache.stats();
    assert!(stats.resident_bytes <= 40 * frame_size);
    assert_eq!(
        stats.resident_bytes,
        stats.entry_count as u64 * frame_size,
        "byte accounting drifted from entry sizes"
    );
    assert_eq!(stats.hits + stats.misses, 4 * 200);
}

#[test]
fn test_preload_workers_do_not_block_foreground_hits() {
    // A deliberately slow loader: preload tasks occupy every worker, yet
    // hits on resident keys stay fast because workers never hold the
    // store lock while loading.
    let loader = Arc::new(CountingLoader::new(Duration::from_millis(25)));
    let config = CacheConfig::default();
    let cache = Arc::new(FrameCache::new(config, Arc::clone(&loader) as Arc<dyn FrameLoader>).unwrap());
    cache.project_opened(FrameRange::new(key(1), key(1000)));

    // Warm one key, then point the preloader at a cold region.
    drop(cache.get(key(900)).unwrap());
    cache.frame_changed(key(100), None, None);
    thread::sleep(Duration::from_millis(30));

    for _ in 0..50 {
        let start = Instant::now();
        let borrow = cache.get(key(900)).unwrap();
        let elapsed = start.elapsed();
        drop(borrow);
        assert!(
            elapsed < Duration::from_millis(10),
            "resident hit stalled behind preload work: {elapsed:?}"
        );
    }
}
