//! Test support: an instrumented engine wrapper
//!
//! `CountingEngine` forwards to any engine while counting calls, and can be
//! told to fail or stall loads and builds. Used by unit tests, integration
//! tests and benchmarks.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use strata_knn_core::{DocId, KnnError, KnnResult, QueryResult};

use crate::engine::VectorEngine;

pub use crate::clock::ManualClock;

/// Engine wrapper that records every call
pub struct CountingEngine<E> {
    inner: E,
    builds: AtomicUsize,
    loads: AtomicUsize,
    queries: AtomicUsize,
    releases: AtomicUsize,
    fail_loads: AtomicUsize,
    fail_builds: AtomicUsize,
    evicted_queries: AtomicUsize,
    load_delay: Mutex<Option<Duration>>,
    build_delay: Mutex<Option<Duration>>,
    serial_queries: AtomicBool,
}

impl<E: VectorEngine> CountingEngine<E> {
    /// Wrap an engine
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            builds: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            fail_loads: AtomicUsize::new(0),
            fail_builds: AtomicUsize::new(0),
            evicted_queries: AtomicUsize::new(0),
            load_delay: Mutex::new(None),
            build_delay: Mutex::new(None),
            serial_queries: AtomicBool::new(false),
        }
    }

    /// Number of `build` calls
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Number of `load` calls, failed ones included
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of `query` calls
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Number of `release` calls
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Make the next `n` loads fail
    pub fn fail_next_loads(&self, n: usize) {
        self.fail_loads.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` builds fail
    pub fn fail_next_builds(&self, n: usize) {
        self.fail_builds.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` queries report that their handle was evicted
    pub fn evict_next_queries(&self, n: usize) {
        self.evicted_queries.store(n, Ordering::SeqCst);
    }

    /// Sleep this long inside every load
    pub fn set_load_delay(&self, delay: Option<Duration>) {
        *self.load_delay.lock() = delay;
    }

    /// Sleep this long inside every build
    pub fn set_build_delay(&self, delay: Option<Duration>) {
        *self.build_delay.lock() = delay;
    }

    /// Report that concurrent queries on one index are unsafe
    pub fn set_serial_queries(&self, serial: bool) {
        self.serial_queries.store(serial, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl<E: VectorEngine> VectorEngine for CountingEngine<E> {
    type Index = E::Index;

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn version_tag(&self) -> Option<&str> {
        self.inner.version_tag()
    }

    fn build(&self, ids: &[DocId], vectors: &[Vec<f32>], output: &Path) -> KnnResult<()> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let delay = *self.build_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if Self::take_failure(&self.fail_builds) {
            return Err(KnnError::build_failed(output, "injected build failure"));
        }
        self.inner.build(ids, vectors, output)
    }

    fn load(&self, path: &Path) -> KnnResult<Self::Index> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.load_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if Self::take_failure(&self.fail_loads) {
            return Err(KnnError::load_failed(path, "injected load failure"));
        }
        self.inner.load(path)
    }

    fn query(&self, index: &Self::Index, vector: &[f32], k: usize) -> KnnResult<Vec<QueryResult>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.evicted_queries) {
            return Err(KnnError::HandleInvalidated {
                path: "<injected>".to_string(),
            });
        }
        self.inner.query(index, vector, k)
    }

    fn release(&self, index: Self::Index) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.release(index);
    }

    fn index_size(&self, index: &Self::Index) -> u64 {
        self.inner.index_size(index)
    }

    fn supports_concurrent_queries(&self) -> bool {
        !self.serial_queries.load(Ordering::SeqCst) && self.inner.supports_concurrent_queries()
    }
}
