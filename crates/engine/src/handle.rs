//! Native index handle
//!
//! A handle wraps one loaded native index. The handle cache is its only owner
//! of record; queries borrow it through an `Arc` for the duration of a call.
//!
//! Two mechanisms keep in-flight queries safe from eviction:
//! - `invalidated` is set before a release is scheduled, so a caller holding a
//!   stale reference sees the eviction and goes back to the cache.
//! - The native index sits behind a read/write lock. Queries take the shared
//!   side, release takes the exclusive side, so release waits for in-flight
//!   queries and queries never overlap with release. Queries do not serialize
//!   against each other.

use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use strata_knn_core::{KnnError, KnnResult, QueryResult};

use crate::engine::VectorEngine;

/// Opaque, non-cloneable reference to a loaded native index
pub struct NativeIndexHandle<E: VectorEngine> {
    path: PathBuf,
    size_bytes: u64,
    invalidated: AtomicBool,
    native: RwLock<Option<E::Index>>,
    /// Present when the engine cannot serve concurrent queries on one index
    query_gate: Option<Mutex<()>>,
    engine: Arc<E>,
}

impl<E: VectorEngine> NativeIndexHandle<E> {
    pub(crate) fn new(path: PathBuf, index: E::Index, engine: Arc<E>) -> Self {
        let size_bytes = engine.index_size(&index);
        let query_gate = (!engine.supports_concurrent_queries()).then(|| Mutex::new(()));
        Self {
            path,
            size_bytes,
            invalidated: AtomicBool::new(false),
            native: RwLock::new(Some(index)),
            query_gate,
            engine,
        }
    }

    /// Sidecar path this handle was loaded from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Native size reported at load time
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Whether the cache has evicted this handle
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    /// Whether the native index has already been freed
    pub fn is_released(&self) -> bool {
        self.native.read().is_none()
    }

    pub(crate) fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
    }

    /// Query the native index
    ///
    /// Returns `HandleInvalidated` if the handle was evicted before the query
    /// could start; the caller should go back to the cache.
    pub fn query(&self, vector: &[f32], k: usize) -> KnnResult<Vec<QueryResult>> {
        if self.is_invalidated() {
            return Err(self.invalidated_error());
        }
        let native = self.native.read();
        let index = native.as_ref().ok_or_else(|| self.invalidated_error())?;
        let _serial = self.query_gate.as_ref().map(|gate| gate.lock());
        self.engine.query(index, vector, k)
    }

    /// Free the native index, waiting for in-flight queries first
    ///
    /// Returns true only for the call that actually released it.
    pub(crate) fn release(&self) -> bool {
        let taken = self.native.write().take();
        match taken {
            Some(index) => {
                self.engine.release(index);
                debug!(
                    target: "strata::knn::cache",
                    path = %self.path.display(),
                    "Released native index"
                );
                true
            }
            None => false,
        }
    }

    fn invalidated_error(&self) -> KnnError {
        KnnError::HandleInvalidated {
            path: self.path.display().to_string(),
        }
    }
}

impl<E: VectorEngine> Drop for NativeIndexHandle<E> {
    fn drop(&mut self) {
        // Normally released by the cache's release worker; this only catches
        // handles whose release task could not be queued.
        if let Some(index) = self.native.get_mut().take() {
            self.engine.release(index);
            debug!(
                target: "strata::knn::cache",
                path = %self.path.display(),
                "Released native index on drop"
            );
        }
    }
}

impl<E: VectorEngine> std::fmt::Debug for NativeIndexHandle<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeIndexHandle")
            .field("path", &self.path)
            .field("size_bytes", &self.size_bytes)
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flat::FlatL2Engine;
    use crate::testing::CountingEngine;
    use tempfile::TempDir;

    type Engine = CountingEngine<FlatL2Engine>;

    fn loaded_handle(dir: &TempDir) -> (NativeIndexHandle<Engine>, Arc<Engine>) {
        let engine = Arc::new(CountingEngine::new(FlatL2Engine::new()));
        let path = dir.path().join("_0.hnsw");
        engine
            .build(&[0, 1], &[vec![0.0, 0.0], vec![3.0, 4.0]], &path)
            .unwrap();
        let index = engine.load(&path).unwrap();
        (NativeIndexHandle::new(path, index, Arc::clone(&engine)), engine)
    }

    #[test]
    fn query_then_release_once() {
        let dir = TempDir::new().unwrap();
        let (handle, engine) = loaded_handle(&dir);

        let results = handle.query(&[0.0, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert!(handle.size_bytes() > 0);

        assert!(handle.release());
        assert!(!handle.release());
        assert!(handle.is_released());
        drop(handle);
        assert_eq!(engine.release_count(), 1);
    }

    #[test]
    fn invalidated_handle_refuses_queries() {
        let dir = TempDir::new().unwrap();
        let (handle, _engine) = loaded_handle(&dir);

        handle.invalidate();
        let err = handle.query(&[0.0, 0.0], 1).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn released_handle_reports_invalidated() {
        let dir = TempDir::new().unwrap();
        let (handle, _engine) = loaded_handle(&dir);

        handle.release();
        let err = handle.query(&[0.0, 0.0], 1).unwrap_err();
        assert!(matches!(err, KnnError::HandleInvalidated { .. }));
    }

    #[test]
    fn drop_releases_unreleased_index() {
        let dir = TempDir::new().unwrap();
        let (handle, engine) = loaded_handle(&dir);
        drop(handle);
        assert_eq!(engine.release_count(), 1);
    }
}
