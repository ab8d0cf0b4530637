//! File lifecycle watcher
//!
//! The host engine deletes a segment's files without telling the handle cache.
//! The watcher notices that a sidecar file disappeared and fires the callback
//! registered for that path, which evicts the cache entry.
//!
//! # Design Notes
//!
//! - Registration happens when a cache entry is created, so an evicted and
//!   reloaded path is watched again
//! - A watch fires at most once and is dropped when it fires
//! - Polling runs in a background thread with a graceful shutdown flag

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use strata_knn_core::{KnnError, KnnResult};

/// Callback invoked with the deleted path
pub type DeletionCallback = Box<dyn Fn(&Path) + Send + Sync>;

/// Capability to observe the deletion of files
pub trait FileLifecycleObserver: Send + Sync {
    /// Start watching `path`, replacing any earlier watch on it
    fn register(&self, path: &Path, on_deleted: DeletionCallback) -> KnnResult<()>;

    /// Stop watching `path`; a no-op for paths that are not watched
    fn unregister(&self, path: &Path);
}

struct WatcherInner {
    watched: Mutex<HashMap<PathBuf, DeletionCallback>>,
    shutdown: AtomicBool,
}

impl WatcherInner {
    fn poll(&self) -> usize {
        let deleted: Vec<(PathBuf, DeletionCallback)> = {
            let mut watched = self.watched.lock();
            let gone: Vec<PathBuf> = watched
                .keys()
                .filter(|path| is_gone(path))
                .cloned()
                .collect();
            gone.into_iter()
                .filter_map(|path| watched.remove(&path).map(|cb| (path, cb)))
                .collect()
        };

        // Callbacks run without the lock so they may unregister or register.
        for (path, on_deleted) in &deleted {
            debug!(target: "strata::knn::watcher", path = %path.display(), "Watched file deleted");
            on_deleted(path);
        }
        deleted.len()
    }
}

fn is_gone(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(_) => false,
        Err(e) => e.kind() == ErrorKind::NotFound,
    }
}

/// Watcher that polls watched paths at a fixed interval
pub struct PollingFileWatcher {
    inner: Arc<WatcherInner>,
    interval: Duration,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PollingFileWatcher {
    /// Create a watcher; call `start` to begin background polling
    pub fn new(interval: Duration) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                watched: Mutex::new(HashMap::new()),
                shutdown: AtomicBool::new(false),
            }),
            interval,
            thread: Mutex::new(None),
        }
    }

    /// Polling interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of watched paths
    pub fn watched_count(&self) -> usize {
        self.inner.watched.lock().len()
    }

    /// Whether `path` is currently watched
    pub fn is_watching(&self, path: &Path) -> bool {
        self.inner.watched.lock().contains_key(path)
    }

    /// Check every watched path once, firing callbacks for deleted files
    ///
    /// Returns the number of deletions observed.
    pub fn poll_once(&self) -> usize {
        self.inner.poll()
    }

    /// Spawn the polling thread. Calling it again is a no-op.
    pub fn start(&self) -> KnnResult<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() || self.inner.shutdown.load(Ordering::Acquire) {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let interval = self.interval;
        let handle = thread::Builder::new()
            .name("knn-watcher".to_string())
            .spawn(move || {
                // Short sleep slices keep shutdown responsive
                let slice = Duration::from_millis(50).min(interval);
                while !inner.shutdown.load(Ordering::Relaxed) {
                    let mut elapsed = Duration::ZERO;
                    while elapsed < interval {
                        if inner.shutdown.load(Ordering::Relaxed) {
                            return;
                        }
                        thread::sleep(slice);
                        elapsed += slice;
                    }
                    inner.poll();
                }
            })?;
        *thread = Some(handle);
        Ok(())
    }

    /// Stop polling and drop every watch. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            // The last reference may be dropped by a callback on the poll thread.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.inner.watched.lock().clear();
    }

    /// Whether `shutdown` has been called
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }
}

impl FileLifecycleObserver for PollingFileWatcher {
    fn register(&self, path: &Path, on_deleted: DeletionCallback) -> KnnResult<()> {
        if self.is_shutdown() {
            return Err(KnnError::WatcherRegistration {
                path: path.display().to_string(),
                reason: "watcher is shut down".to_string(),
            });
        }
        if let Err(e) = std::fs::metadata(path) {
            warn!(
                target: "strata::knn::watcher",
                path = %path.display(),
                error = %e,
                "Cannot watch file"
            );
            return Err(KnnError::WatcherRegistration {
                path: path.display().to_string(),
                reason: e.to_string(),
            });
        }
        self.inner
            .watched
            .lock()
            .insert(path.to_path_buf(), on_deleted);
        debug!(target: "strata::knn::watcher", path = %path.display(), "Watching file");
        Ok(())
    }

    fn unregister(&self, path: &Path) {
        if self.inner.watched.lock().remove(path).is_some() {
            debug!(target: "strata::knn::watcher", path = %path.display(), "Stopped watching file");
        }
    }
}

impl Drop for PollingFileWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
