//! End-to-end lifecycle tests through `KnnRuntime`
//!
//! Segment flush and merge build sidecars, searches load them through the
//! cache, and segment deletion, idle time and shutdown take them away again.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use strata_knn_core::{encode_vector, DocId, KnnConfig, KnnResult, SidecarIndexFile};
use strata_knn_engine::testing::CountingEngine;
use strata_knn_engine::{
    prepare_compound, DocMap, FlatL2Engine, KnnQuery, KnnRuntime, MergeInput, RemovalReason,
    SegmentContext, SegmentWriteState,
};
use tempfile::TempDir;

type Runtime = KnnRuntime<CountingEngine<FlatL2Engine>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn runtime(config: KnnConfig) -> Runtime {
    KnnRuntime::open(config, CountingEngine::new(FlatL2Engine::new())).unwrap()
}

fn encoded(vectors: &[Vec<f32>]) -> Vec<KnnResult<(DocId, Vec<u8>)>> {
    vectors
        .iter()
        .enumerate()
        .map(|(doc, v)| Ok((doc as DocId, encode_vector(v))))
        .collect()
}

fn flush(runtime: &Runtime, dir: &Path, segment: &str, vectors: &[Vec<f32>]) -> SidecarIndexFile {
    let state = SegmentWriteState::new(dir, segment);
    runtime
        .writer()
        .write_flush(&state, encoded(vectors))
        .unwrap()
        .unwrap()
}

fn context(dir: &Path, file: &SidecarIndexFile) -> SegmentContext {
    SegmentContext::new(
        dir,
        file.segment.clone(),
        vec![format!("{}.si", file.segment), file.file_name().unwrap()],
    )
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[test]
fn test_flush_then_search_scenario() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let runtime = runtime(KnnConfig::default());
    let file = flush(
        &runtime,
        dir.path(),
        "_0",
        &[
            vec![1.0, 2.0, 3.0, 4.0],
            vec![5.0, 6.0, 7.0, 8.0],
            vec![9.0, 10.0, 11.0, 12.0],
        ],
    );

    let query = KnnQuery::new("my_vector", vec![1.0, 1.0, 1.0, 1.0], 3).unwrap();
    let outcome = runtime.search(&[context(dir.path(), &file)], &query).unwrap();
    let top = outcome.top_k(3);

    assert_eq!(top.iter().map(|r| r.doc).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert!(top.windows(2).all(|w| w[0].score < w[1].score));
}

#[test]
fn test_round_trip_finds_every_indexed_vector() {
    let dir = TempDir::new().unwrap();
    let runtime = runtime(KnnConfig::default());
    let vectors: Vec<Vec<f32>> = (0..20)
        .map(|i| vec![i as f32, (i * i) as f32, -(i as f32)])
        .collect();
    let file = flush(&runtime, dir.path(), "_0", &vectors);
    let segment = context(dir.path(), &file);

    for (doc, vector) in vectors.iter().enumerate() {
        let query = KnnQuery::new("v", vector.clone(), 3).unwrap();
        let scorer = runtime.executor().search_segment(&segment, &query).unwrap();
        assert_eq!(scorer.score_of(doc as DocId), Some(0.0));
    }
    assert_eq!(runtime.engine().load_count(), 1);
}

#[test]
fn test_merge_indexes_only_live_documents() {
    let dir = TempDir::new().unwrap();
    let runtime = runtime(KnnConfig::default());

    // Two flushed segments sharing old ids 0..4, with two deletions each
    let a: Vec<Vec<f32>> = (0..4).map(|i| vec![i as f32, 0.0]).collect();
    let b: Vec<Vec<f32>> = (0..4).map(|i| vec![i as f32, 100.0]).collect();
    let map_a = DocMap::new(vec![Some(0), None, Some(1), None]);
    let map_b = DocMap::new(vec![None, Some(2), None, Some(3)]);
    let live = map_a.live_count() + map_b.live_count();

    let state = SegmentWriteState::new(dir.path(), "_2");
    let merged = runtime
        .writer()
        .write_merge(
            &state,
            vec![
                MergeInput::new(encoded(&a), map_a),
                MergeInput::new(encoded(&b), map_b),
            ],
        )
        .unwrap()
        .unwrap();
    assert_eq!(merged.record_count, live);
    assert_ne!(merged.record_count, a.len() + b.len());

    // New id 3 is old doc 3 of the second segment
    let query = KnnQuery::new("v", vec![3.0, 100.0], 1).unwrap();
    let scorer = runtime
        .executor()
        .search_segment(&context(dir.path(), &merged), &query)
        .unwrap();
    assert_eq!(scorer.score_of(3), Some(0.0));
}

#[test]
fn test_segment_deletion_evicts_and_reloads() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut config = KnnConfig::default();
    config.watcher.interval_ms = Some(10);
    let runtime = runtime(config);
    let file = flush(&runtime, dir.path(), "_0", &[vec![1.0, 1.0]]);

    runtime.cache().get(file.path()).unwrap();
    assert!(runtime.watcher().unwrap().is_watching(file.path()));

    fs::remove_file(file.path()).unwrap();
    assert!(wait_until(Duration::from_secs(2), || !runtime
        .cache()
        .contains(file.path())));
    assert_eq!(
        runtime.cache().stats().removals_for(RemovalReason::Deleted),
        1
    );

    // A rebuilt segment file under the same name is loaded afresh
    let rebuilt = flush(&runtime, dir.path(), "_0", &[vec![2.0, 2.0]]);
    runtime.cache().get(rebuilt.path()).unwrap();
    assert_eq!(runtime.engine().load_count(), 2);
}

#[test]
fn test_idle_entries_are_swept() {
    let dir = TempDir::new().unwrap();
    let mut config = KnnConfig::default();
    config.cache.idle_timeout_ms = 50;
    config.cache.sweep_interval_ms = 20;
    config.watcher.enabled = false;
    let runtime = runtime(config);
    let file = flush(&runtime, dir.path(), "_0", &[vec![1.0]]);

    runtime.cache().get(file.path()).unwrap();
    assert!(wait_until(Duration::from_secs(2), || runtime.cache().is_empty()));
    assert!(wait_until(Duration::from_secs(2), || runtime
        .engine()
        .release_count()
        == 1));
}

#[test]
fn test_compound_segment_is_searchable() {
    let dir = TempDir::new().unwrap();
    let runtime = runtime(KnnConfig::default());
    let file = flush(&runtime, dir.path(), "_5", &[vec![0.0, 3.0], vec![4.0, 0.0]]);

    let files = vec!["_5.si".to_string(), file.file_name().unwrap()];
    let packed = prepare_compound(dir.path(), &files).unwrap();
    assert_eq!(packed, vec!["_5.si".to_string()]);

    let compound_files = vec!["_5.cfs".to_string(), "_5_flat1.hnswc".to_string()];
    let segment = SegmentContext::new(dir.path(), "_5", compound_files).with_compound(true);
    let query = KnnQuery::new("v", vec![0.0, 0.0], 2).unwrap();
    let scorer = runtime.executor().search_segment(&segment, &query).unwrap();
    assert_eq!(scorer.score_of(0), Some(3.0));
    assert_eq!(scorer.score_of(1), Some(4.0));
}

#[test]
fn test_shutdown_releases_every_handle_once() {
    let dir = TempDir::new().unwrap();
    let runtime = runtime(KnnConfig::default());
    let files: Vec<SidecarIndexFile> = (0..5)
        .map(|i| flush(&runtime, dir.path(), &format!("_{}", i), &[vec![i as f32]]))
        .collect();
    for file in &files {
        runtime.cache().get(file.path()).unwrap();
    }
    runtime.cache().invalidate(files[0].path());

    runtime.shutdown();
    assert_eq!(runtime.engine().release_count(), 5);
    assert!(runtime.cache().get(files[1].path()).is_err());
}
