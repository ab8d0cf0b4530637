//! k-NN query path benchmarks
//!
//! Run with: cargo bench -p strata-knn-engine --bench query_benchmarks
//!
//! - knn_warm_query: executor query against a cached handle, various k
//! - knn_cache_hit: handle cache lookup alone
//! - knn_cold_load: invalidate + reload + query

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tempfile::TempDir;

use strata_knn_core::{CacheConfig, DocId, QueryConfig};
use strata_knn_engine::{
    FlatL2Engine, HandleCache, KnnExecutor, KnnQuery, SegmentContext, VectorEngine,
};

/// Fixed seed for reproducible benchmarks
const BENCH_SEED: u64 = 0xDEADBEEF_CAFEBABE;
const DIMENSION: usize = 128;

struct Fixture {
    _dir: TempDir,
    executor: KnnExecutor<FlatL2Engine>,
    segment: SegmentContext,
    rng: StdRng,
}

fn fixture(count: usize) -> Fixture {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(FlatL2Engine::new());
    let mut rng = StdRng::seed_from_u64(BENCH_SEED);

    let vectors: Vec<Vec<f32>> = (0..count)
        .map(|_| (0..DIMENSION).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect();
    let ids: Vec<DocId> = (0..count as DocId).collect();
    engine
        .build(&ids, &vectors, &dir.path().join("_0.hnsw"))
        .unwrap();

    let cache = HandleCache::builder(Arc::clone(&engine), CacheConfig::unbounded())
        .sweeper(false)
        .build()
        .unwrap();
    let executor = KnnExecutor::new(Arc::new(cache), QueryConfig::default());
    let segment = SegmentContext::new(dir.path(), "_0", vec!["_0.hnsw".to_string()]);
    Fixture {
        _dir: dir,
        executor,
        segment,
        rng,
    }
}

fn random_query(rng: &mut StdRng, k: usize) -> KnnQuery {
    let vector = (0..DIMENSION).map(|_| rng.gen_range(-1.0..1.0)).collect();
    KnnQuery::new("embedding", vector, k).unwrap()
}

fn bench_warm_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("knn_warm_query");
    for &count in &[1_000usize, 10_000] {
        let mut fx = fixture(count);
        // Warm the cache
        let q = random_query(&mut fx.rng, 1);
        fx.executor.search_segment(&fx.segment, &q).unwrap();

        group.throughput(Throughput::Elements(count as u64));
        for &k in &[1usize, 10, 100] {
            let query = random_query(&mut fx.rng, k);
            group.bench_with_input(
                BenchmarkId::new(format!("n={}", count), k),
                &query,
                |b, query| {
                    b.iter(|| {
                        black_box(fx.executor.search_segment(&fx.segment, query).unwrap());
                    })
                },
            );
        }
    }
    group.finish();
}

fn bench_cache_hit(c: &mut Criterion) {
    let fx = fixture(100);
    let path = fx.segment.resolve_sidecar().unwrap().unwrap();
    let cache = Arc::clone(fx.executor.cache());
    cache.get(&path).unwrap();

    c.bench_function("knn_cache_hit", |b| {
        b.iter(|| black_box(cache.get(&path).unwrap()));
    });
}

fn bench_cold_load(c: &mut Criterion) {
    let mut fx = fixture(1_000);
    let path = fx.segment.resolve_sidecar().unwrap().unwrap();
    let query = random_query(&mut fx.rng, 10);
    let cache = Arc::clone(fx.executor.cache());

    c.bench_function("knn_cold_load", |b| {
        b.iter(|| {
            cache.invalidate(&path);
            black_box(fx.executor.search_segment(&fx.segment, &query).unwrap());
        });
    });
    cache.drain_releases();
}

criterion_group!(benches, bench_warm_query, bench_cache_hit, bench_cold_load);
criterion_main!(benches);
