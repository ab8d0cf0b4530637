//! Concurrent tests for the handle cache
//!
//! These exercise the cache under real thread interleavings:
//!
//! 1. **Single-flight** - One engine load per key under a stampede
//! 2. **Failure sharing** - Every waiter of a failed load sees the same error
//! 3. **Eviction safety** - Invalidation never hands out a dead handle
//! 4. **Release exactly once** - Racing removal paths release once
//! 5. **Weight bound** - The budget holds after every insertion
//!
//! ```bash
//! cargo test -p strata-knn-engine --test concurrent_cache_tests
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strata_knn_core::{CacheConfig, DocId, KnnError, QueryConfig};
use strata_knn_engine::testing::CountingEngine;
use strata_knn_engine::{
    FlatL2Engine, HandleCache, KnnExecutor, KnnQuery, RemovalReason, SegmentContext, VectorEngine,
};
use tempfile::TempDir;

// ============================================================================
// Test Helpers
// ============================================================================

type Engine = CountingEngine<FlatL2Engine>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn counting_engine() -> Arc<Engine> {
    Arc::new(CountingEngine::new(FlatL2Engine::new()))
}

fn random_vectors(rng: &mut StdRng, count: usize, dimension: usize) -> Vec<Vec<f32>> {
    (0..count)
        .map(|_| (0..dimension).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect()
}

/// Build `count` sidecars of identical size and return their paths
fn build_sidecars(engine: &Engine, dir: &TempDir, count: usize) -> Vec<PathBuf> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..count)
        .map(|i| {
            let path = dir.path().join(format!("_{}.hnsw", i));
            let vectors = random_vectors(&mut rng, 16, 8);
            let ids: Vec<DocId> = (0..16).collect();
            engine.build(&ids, &vectors, &path).unwrap();
            path
        })
        .collect()
}

fn cache(engine: &Arc<Engine>, config: CacheConfig) -> Arc<HandleCache<Engine>> {
    Arc::new(
        HandleCache::builder(Arc::clone(engine), config)
            .sweeper(false)
            .build()
            .unwrap(),
    )
}

// ============================================================================
// SECTION 1: Single-flight loads
// ============================================================================

mod single_flight {
    use super::*;

    #[test]
    fn test_stampede_loads_once() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let engine = counting_engine();
        let path = build_sidecars(&engine, &dir, 1).remove(0);
        engine.set_load_delay(Some(Duration::from_millis(50)));
        let cache = cache(&engine, CacheConfig::unbounded());

        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                let path = path.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache.get(&path).unwrap()
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(engine.load_count(), 1);
        assert!(results.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_different_keys_load_independently() {
        let dir = TempDir::new().unwrap();
        let engine = counting_engine();
        let paths = build_sidecars(&engine, &dir, 4);
        engine.set_load_delay(Some(Duration::from_millis(100)));
        let cache = cache(&engine, CacheConfig::unbounded());

        let started = std::time::Instant::now();
        let handles: Vec<_> = paths
            .iter()
            .cloned()
            .map(|path| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.get(&path).map(|_| ()))
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }

        assert_eq!(engine.load_count(), 4);
        // Serialized loads would take at least 400ms
        assert!(started.elapsed() < Duration::from_millis(390));
    }

    #[test]
    fn test_failed_load_is_shared_then_retried() {
        let dir = TempDir::new().unwrap();
        let engine = counting_engine();
        let path = build_sidecars(&engine, &dir, 1).remove(0);
        engine.set_load_delay(Some(Duration::from_millis(50)));
        engine.fail_next_loads(1);
        let cache = cache(&engine, CacheConfig::unbounded());

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                let path = path.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache.get(&path).map(|_| ())
                })
            })
            .collect();
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Waiters that joined the failed flight all see its error; a thread
        // arriving after it may have started a successful second load.
        let errors: Vec<&KnnError> = outcomes.iter().filter_map(|o| o.as_ref().err()).collect();
        assert!(!errors.is_empty());
        assert!(errors.windows(2).all(|w| w[0] == w[1]));
        assert!(engine.load_count() <= 2);

        engine.set_load_delay(None);
        cache.get(&path).unwrap();
        assert!(cache.contains(&path));
    }
}

// ============================================================================
// SECTION 2: Eviction safety and release accounting
// ============================================================================

mod eviction_safety {
    use super::*;

    #[test]
    fn test_get_after_invalidate_never_returns_dead_handle() {
        let dir = TempDir::new().unwrap();
        let engine = counting_engine();
        let path = build_sidecars(&engine, &dir, 1).remove(0);
        let cache = cache(&engine, CacheConfig::unbounded());

        for _ in 0..50 {
            let before = cache.get(&path).unwrap();
            assert!(cache.invalidate(&path));
            let after = cache.get(&path).unwrap();
            assert!(before.is_invalidated());
            assert!(!after.is_invalidated());
            assert!(!Arc::ptr_eq(&before, &after));
        }
        assert_eq!(engine.load_count(), 51);
    }

    #[test]
    fn test_racing_removals_release_each_handle_once() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let engine = counting_engine();
        let path = build_sidecars(&engine, &dir, 1).remove(0);
        let cache = cache(&engine, CacheConfig::unbounded());

        let rounds = 100;
        for _ in 0..rounds {
            cache.get(&path).unwrap();
            let barrier = Arc::new(Barrier::new(4));
            let removed = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let cache = Arc::clone(&cache);
                    let barrier = Arc::clone(&barrier);
                    let removed = Arc::clone(&removed);
                    let path = path.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        if cache.invalidate(&path) {
                            removed.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(removed.load(Ordering::SeqCst), 1);
        }

        cache.drain_releases();
        assert_eq!(engine.release_count(), rounds);
        assert_eq!(cache.stats().removals_for(RemovalReason::Explicit), rounds as u64);
    }

    #[test]
    fn test_queries_survive_concurrent_invalidation() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let engine = counting_engine();
        let paths = build_sidecars(&engine, &dir, 1);
        let cache = cache(&engine, CacheConfig::unbounded());
        let executor = Arc::new(KnnExecutor::new(
            Arc::clone(&cache),
            QueryConfig {
                eviction_retries: 3,
                ..QueryConfig::default()
            },
        ));
        let segment = SegmentContext::new(dir.path(), "_0", vec!["_0.hnsw".to_string()]);
        let query = KnnQuery::new("vec", vec![0.0; 8], 5).unwrap();

        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let invalidator = {
            let cache = Arc::clone(&cache);
            let stop = Arc::clone(&stop);
            let path = paths[0].clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    cache.invalidate(&path);
                    thread::yield_now();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let executor = Arc::clone(&executor);
                let segment = segment.clone();
                let query = query.clone();
                thread::spawn(move || {
                    let mut ok = 0;
                    for _ in 0..200 {
                        match executor.search_segment(&segment, &query) {
                            Ok(scorer) => {
                                assert_eq!(scorer.len(), 5);
                                ok += 1;
                            }
                            Err(e) => assert!(e.is_transient(), "unexpected error: {}", e),
                        }
                    }
                    ok
                })
            })
            .collect();

        let succeeded: usize = readers.into_iter().map(|h| h.join().unwrap()).sum();
        stop.store(true, Ordering::Relaxed);
        invalidator.join().unwrap();
        assert!(succeeded > 0);

        cache.shutdown();
        assert_eq!(engine.release_count(), engine.load_count());
    }
}

// ============================================================================
// SECTION 3: Weight bound
// ============================================================================

mod weight_bound {
    use super::*;

    #[test]
    fn test_budget_holds_under_concurrent_loads() {
        let dir = TempDir::new().unwrap();
        let engine = counting_engine();
        let paths = build_sidecars(&engine, &dir, 12);
        let size = std::fs::metadata(&paths[0]).unwrap().len();
        let budget = size * 3;
        let cache = cache(&engine, CacheConfig::unbounded().with_weight_budget(budget));

        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let cache = Arc::clone(&cache);
                let paths = paths.clone();
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(t);
                    for _ in 0..100 {
                        let path = &paths[rng.gen_range(0..paths.len())];
                        cache.get(path).unwrap();
                        assert!(cache.weight_bytes() <= budget);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(cache.len() <= 3);
        assert!(cache.weight_bytes() <= budget);
        let stats = cache.stats();
        assert_eq!(stats.weight_bytes, size * stats.entries as u64);
    }
}
