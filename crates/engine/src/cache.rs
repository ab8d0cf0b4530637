//! Native handle cache
//!
//! Maps a sidecar path to its loaded `NativeIndexHandle`. The cache is the
//! only owner of record for handles; callers get an `Arc` for one query and
//! never release anything themselves.
//!
//! # Design Notes
//!
//! - Misses load through a per-key single-flight slot, so concurrent callers
//!   for one path wait on one engine load while other paths proceed
//! - Failed loads are handed to every waiter and then forgotten
//! - Every removal runs the same path: take the entry out of the map, mark
//!   the handle invalidated, then queue the native release on a dedicated
//!   single-threaded worker
//! - Watch registration changes happen under the entry lock, keeping the
//!   watcher in step with the map
//! - Eviction is least-recently-used against a byte budget, plus idle expiry
//!   checked lazily on lookup and by a background sweeper

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use strata_knn_core::{CacheConfig, KnnError, KnnResult};

use crate::clock::{Clock, SystemClock};
use crate::engine::VectorEngine;
use crate::handle::NativeIndexHandle;
use crate::watcher::FileLifecycleObserver;
use crate::worker::WorkerPool;

/// Why an entry left the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalReason {
    /// `invalidate` was called
    Explicit,
    /// Unused for longer than the idle timeout
    Expired,
    /// Evicted to stay within the weight budget
    Weight,
    /// A new handle was put under the same path
    Replaced,
    /// The watcher saw the sidecar file disappear
    Deleted,
    /// The cache was shut down
    Shutdown,
}

impl RemovalReason {
    /// Every reason, in counter order
    pub const ALL: [RemovalReason; 6] = [
        RemovalReason::Explicit,
        RemovalReason::Expired,
        RemovalReason::Weight,
        RemovalReason::Replaced,
        RemovalReason::Deleted,
        RemovalReason::Shutdown,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Lowercase name used in logs
    pub fn as_str(self) -> &'static str {
        match self {
            RemovalReason::Explicit => "explicit",
            RemovalReason::Expired => "expired",
            RemovalReason::Weight => "weight",
            RemovalReason::Replaced => "replaced",
            RemovalReason::Deleted => "deleted",
            RemovalReason::Shutdown => "shutdown",
        }
    }

    /// Whether the watch on the path should be dropped with the entry
    fn drops_watch(self) -> bool {
        // Replaced keeps the watch for the new handle; Deleted already fired it.
        !matches!(self, RemovalReason::Replaced | RemovalReason::Deleted)
    }
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time cache metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Live entries
    pub entries: usize,
    /// Sum of live entry weights
    pub weight_bytes: u64,
    /// Lookups answered from the map
    pub hits: u64,
    /// Lookups that went to the single-flight load path
    pub misses: u64,
    /// Successful engine loads
    pub loads: u64,
    /// Failed engine loads
    pub load_failures: u64,
    /// Removals, indexed like `RemovalReason::ALL`
    pub removals: [u64; 6],
    /// Native releases completed by the release worker
    pub releases: u64,
    /// Releases queued but not yet run
    pub pending_releases: usize,
}

impl CacheStats {
    /// Removals for one reason
    pub fn removals_for(&self, reason: RemovalReason) -> u64 {
        self.removals[reason.index()]
    }

    /// Removals for every reason
    pub fn total_removals(&self) -> u64 {
        self.removals.iter().sum()
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    releases: AtomicU64,
    pending_releases: AtomicUsize,
    removals: [AtomicU64; 6],
}

type Handle<E> = Arc<NativeIndexHandle<E>>;
type LoadSlot<E> = OnceCell<KnnResult<Handle<E>>>;

struct CacheEntry<E: VectorEngine> {
    handle: Handle<E>,
    /// Clock nanos of the last lookup, for idle expiry
    last_access: AtomicU64,
    /// Global access sequence, for LRU order
    access_seq: AtomicU64,
}

impl<E: VectorEngine> CacheEntry<E> {
    fn touch(&self, now: u64, seq: u64) {
        self.last_access.store(now, Ordering::Relaxed);
        self.access_seq.store(seq, Ordering::Relaxed);
    }
}

struct Entries<E: VectorEngine> {
    map: HashMap<PathBuf, CacheEntry<E>>,
    weight: u64,
}

impl<E: VectorEngine> Entries<E> {
    fn take(&mut self, path: &Path) -> Option<Handle<E>> {
        let entry = self.map.remove(path)?;
        self.weight -= entry.handle.size_bytes();
        entry.handle.invalidate();
        Some(entry.handle)
    }

    fn least_recently_used(&self, keep: Option<&Path>) -> Option<PathBuf> {
        self.map
            .iter()
            .filter(|(path, _)| Some(path.as_path()) != keep)
            .min_by_key(|(_, entry)| entry.access_seq.load(Ordering::Relaxed))
            .map(|(path, _)| path.clone())
    }
}

type Removed<E> = Vec<(PathBuf, Handle<E>, RemovalReason)>;

struct CacheInner<E: VectorEngine> {
    self_ref: Weak<CacheInner<E>>,
    engine: Arc<E>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    observer: Option<Arc<dyn FileLifecycleObserver>>,
    entries: RwLock<Entries<E>>,
    loading: DashMap<PathBuf, Arc<LoadSlot<E>>>,
    releaser: WorkerPool,
    counters: Arc<Counters>,
    access_seq: AtomicU64,
    shutdown: AtomicBool,
}

impl<E: VectorEngine> CacheInner<E> {
    fn ensure_open(&self) -> KnnResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            Err(KnnError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn now_nanos(&self) -> u64 {
        self.clock.now().as_nanos() as u64
    }

    fn next_seq(&self) -> u64 {
        self.access_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn is_expired(&self, entry: &CacheEntry<E>, now: u64) -> bool {
        match self.config.idle_timeout() {
            Some(idle) => {
                let last = entry.last_access.load(Ordering::Relaxed);
                now.saturating_sub(last) >= idle.as_nanos() as u64
            }
            None => false,
        }
    }

    /// Map lookup that touches the entry, or expires it if idle too long
    fn lookup(&self, path: &Path) -> Option<Handle<E>> {
        let now = self.now_nanos();
        {
            let entries = self.entries.read();
            let entry = entries.map.get(path)?;
            if !self.is_expired(entry, now) {
                entry.touch(now, self.next_seq());
                return Some(Arc::clone(&entry.handle));
            }
        }

        let removed = {
            let mut entries = self.entries.write();
            // Re-check: another caller may have touched or reloaded the entry.
            let still_expired = entries
                .map
                .get(path)
                .map_or(false, |entry| self.is_expired(entry, now));
            if still_expired {
                self.detach(&mut entries, path, RemovalReason::Expired)
            } else {
                None
            }
        };
        if let Some(handle) = removed {
            self.finish_removal(path, handle, RemovalReason::Expired);
        }
        None
    }

    fn load_once(&self, path: &Path) -> KnnResult<Handle<E>> {
        let key = path.to_path_buf();
        let slot = Arc::clone(&*self.loading.entry(key.clone()).or_default());
        let outcome = slot.get_or_init(|| self.load_and_insert(&key)).clone();
        self.loading
            .remove_if(&key, |_, current| Arc::ptr_eq(current, &slot));
        outcome
    }

    fn load_and_insert(&self, path: &Path) -> KnnResult<Handle<E>> {
        // A load that finished between our miss and taking the slot already
        // inserted the handle.
        if let Some(handle) = self.lookup(path) {
            return Ok(handle);
        }
        self.ensure_open()?;

        let started = Instant::now();
        let index = match self.engine.load(path) {
            Ok(index) => index,
            Err(e) => {
                self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "strata::knn::cache",
                    path = %path.display(),
                    error = %e,
                    "Sidecar load failed"
                );
                return Err(e);
            }
        };
        self.counters.loads.fetch_add(1, Ordering::Relaxed);

        let handle = Arc::new(NativeIndexHandle::new(
            path.to_path_buf(),
            index,
            Arc::clone(&self.engine),
        ));
        debug!(
            target: "strata::knn::cache",
            path = %path.display(),
            size_bytes = handle.size_bytes(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Loaded sidecar"
        );
        self.admit(path, handle)
    }

    /// Insert a freshly created handle, enforcing the weight budget
    fn admit(&self, path: &Path, handle: Handle<E>) -> KnnResult<Handle<E>> {
        if let Some(budget) = self.config.weight_budget() {
            let size_bytes = handle.size_bytes();
            if size_bytes > budget {
                warn!(
                    target: "strata::knn::cache",
                    path = %path.display(),
                    size_bytes,
                    budget_bytes = budget,
                    "Handle exceeds weight budget, not caching"
                );
                self.discard(handle);
                return Err(KnnError::WeightBudgetExceeded {
                    path: path.display().to_string(),
                    size_bytes,
                    budget_bytes: budget,
                });
            }
        }

        let mut removed: Removed<E> = Vec::new();
        {
            let mut entries = self.entries.write();
            if self.shutdown.load(Ordering::Acquire) {
                drop(entries);
                self.discard(handle);
                return Err(KnnError::ShutDown);
            }

            self.watch(path);
            if let Some(old) = self.detach(&mut entries, path, RemovalReason::Replaced) {
                removed.push((path.to_path_buf(), old, RemovalReason::Replaced));
            }

            let now = self.now_nanos();
            entries.weight += handle.size_bytes();
            entries.map.insert(
                path.to_path_buf(),
                CacheEntry {
                    handle: Arc::clone(&handle),
                    last_access: AtomicU64::new(now),
                    access_seq: AtomicU64::new(self.next_seq()),
                },
            );

            if let Some(budget) = self.config.weight_budget() {
                self.evict_to_budget(&mut entries, budget, Some(path), &mut removed);
            }
        }

        for (victim, old, reason) in removed {
            self.finish_removal(&victim, old, reason);
        }
        Ok(handle)
    }

    fn evict_to_budget(
        &self,
        entries: &mut Entries<E>,
        budget: u64,
        keep: Option<&Path>,
        removed: &mut Removed<E>,
    ) {
        while entries.weight > budget {
            let Some(victim) = entries.least_recently_used(keep) else {
                break;
            };
            if let Some(handle) = self.detach(entries, &victim, RemovalReason::Weight) {
                removed.push((victim, handle, RemovalReason::Weight));
            }
        }
    }

    /// Register a deletion watch that evicts `path` through a weak reference
    fn watch(&self, path: &Path) {
        let Some(observer) = &self.observer else {
            return;
        };
        let cache = Weak::clone(&self.self_ref);
        let on_deleted = Box::new(move |deleted: &Path| {
            if let Some(cache) = cache.upgrade() {
                cache.remove(deleted, RemovalReason::Deleted);
            }
        });
        if let Err(e) = observer.register(path, on_deleted) {
            warn!(
                target: "strata::knn::cache",
                path = %path.display(),
                error = %e,
                "Watch registration failed, relying on time and weight eviction"
            );
        }
    }

    /// Take an entry out of the map under the write lock
    fn detach(
        &self,
        entries: &mut Entries<E>,
        path: &Path,
        reason: RemovalReason,
    ) -> Option<Handle<E>> {
        let handle = entries.take(path)?;
        if reason.drops_watch() {
            if let Some(observer) = &self.observer {
                observer.unregister(path);
            }
        }
        Some(handle)
    }

    /// Account for a removal and queue its release, outside the lock
    fn finish_removal(&self, path: &Path, handle: Handle<E>, reason: RemovalReason) {
        self.counters.removals[reason.index()].fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "strata::knn::cache",
            path = %path.display(),
            reason = %reason,
            size_bytes = handle.size_bytes(),
            "Removed handle"
        );
        self.schedule_release(handle);
    }

    fn remove(&self, path: &Path, reason: RemovalReason) -> bool {
        let removed = {
            let mut entries = self.entries.write();
            self.detach(&mut entries, path, reason)
        };
        match removed {
            Some(handle) => {
                self.finish_removal(path, handle, reason);
                true
            }
            None => false,
        }
    }

    /// Release a handle that never made it into the map
    fn discard(&self, handle: Handle<E>) {
        handle.invalidate();
        self.schedule_release(handle);
    }

    fn schedule_release(&self, handle: Handle<E>) {
        let path = handle.path().to_path_buf();
        let counters = Arc::clone(&self.counters);
        counters.pending_releases.fetch_add(1, Ordering::Relaxed);
        let task = move || {
            if handle.release() {
                counters.releases.fetch_add(1, Ordering::Relaxed);
            }
            counters.pending_releases.fetch_sub(1, Ordering::Relaxed);
        };
        if self.releaser.submit(task).is_err() {
            // The dropped task's handle releases itself once the last
            // in-flight query lets go of it.
            self.counters
                .pending_releases
                .fetch_sub(1, Ordering::Relaxed);
            warn!(
                target: "strata::knn::cache",
                path = %path.display(),
                "Release queue unavailable, releasing on drop"
            );
        }
    }

    fn run_maintenance(&self) -> usize {
        if self.shutdown.load(Ordering::Acquire) {
            return 0;
        }
        let now = self.now_nanos();
        let mut removed: Removed<E> = Vec::new();
        {
            let mut entries = self.entries.write();
            let expired: Vec<PathBuf> = entries
                .map
                .iter()
                .filter(|(_, entry)| self.is_expired(entry, now))
                .map(|(path, _)| path.clone())
                .collect();
            for path in expired {
                if let Some(handle) = self.detach(&mut entries, &path, RemovalReason::Expired) {
                    removed.push((path, handle, RemovalReason::Expired));
                }
            }
            if let Some(budget) = self.config.weight_budget() {
                self.evict_to_budget(&mut entries, budget, None, &mut removed);
            }
        }

        let count = removed.len();
        for (path, handle, reason) in removed {
            self.finish_removal(&path, handle, reason);
        }
        count
    }
}

/// Builder for a `HandleCache`
pub struct HandleCacheBuilder<E: VectorEngine> {
    engine: Arc<E>,
    config: CacheConfig,
    clock: Option<Arc<dyn Clock>>,
    observer: Option<Arc<dyn FileLifecycleObserver>>,
    sweeper: bool,
}

impl<E: VectorEngine> HandleCacheBuilder<E> {
    /// Use a custom time source
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Evict entries when the observer reports their file deleted
    pub fn observer(mut self, observer: Arc<dyn FileLifecycleObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Whether to spawn the idle sweeper thread (default true)
    pub fn sweeper(mut self, enabled: bool) -> Self {
        self.sweeper = enabled;
        self
    }

    /// Create the cache and its background threads
    pub fn build(self) -> KnnResult<HandleCache<E>> {
        let spawn_sweeper_thread = self.sweeper && self.config.idle_timeout().is_some();
        if spawn_sweeper_thread && self.config.sweep_interval_ms == 0 {
            return Err(KnnError::InvalidConfig(
                "cache.sweep_interval_ms must be > 0".into(),
            ));
        }
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::default()));
        let releaser = WorkerPool::new("knn-release", 1, self.config.release_queue_depth);
        let inner = Arc::new_cyclic(|self_ref| CacheInner {
            self_ref: Weak::clone(self_ref),
            engine: self.engine,
            config: self.config,
            clock,
            observer: self.observer,
            entries: RwLock::new(Entries {
                map: HashMap::new(),
                weight: 0,
            }),
            loading: DashMap::new(),
            releaser,
            counters: Arc::new(Counters::default()),
            access_seq: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        let sweeper_stop = Arc::new(AtomicBool::new(false));
        let sweeper = if spawn_sweeper_thread {
            Some(spawn_sweeper(
                Arc::downgrade(&inner),
                inner.config.sweep_interval(),
                Arc::clone(&sweeper_stop),
            )?)
        } else {
            None
        };

        Ok(HandleCache {
            inner,
            sweeper: Mutex::new(sweeper),
            sweeper_stop,
        })
    }
}

fn spawn_sweeper<E: VectorEngine>(
    cache: Weak<CacheInner<E>>,
    interval: Duration,
    stop: Arc<AtomicBool>,
) -> KnnResult<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("knn-sweeper".to_string())
        .spawn(move || {
            let slice = Duration::from_millis(100).min(interval);
            while !stop.load(Ordering::Relaxed) {
                let mut elapsed = Duration::ZERO;
                while elapsed < interval {
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                    thread::sleep(slice);
                    elapsed += slice;
                }
                let Some(inner) = cache.upgrade() else {
                    return;
                };
                let removed = inner.run_maintenance();
                if removed > 0 {
                    debug!(target: "strata::knn::cache", removed, "Sweep evicted handles");
                }
            }
        })?;
    Ok(handle)
}

/// Concurrency-safe cache of loaded native index handles
pub struct HandleCache<E: VectorEngine> {
    inner: Arc<CacheInner<E>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    sweeper_stop: Arc<AtomicBool>,
}

impl<E: VectorEngine> HandleCache<E> {
    /// Start building a cache over `engine`
    pub fn builder(engine: Arc<E>, config: CacheConfig) -> HandleCacheBuilder<E> {
        HandleCacheBuilder {
            engine,
            config,
            clock: None,
            observer: None,
            sweeper: true,
        }
    }

    /// Cache with the system clock and no lifecycle observer
    pub fn new(engine: Arc<E>, config: CacheConfig) -> KnnResult<Self> {
        Self::builder(engine, config).build()
    }

    /// Return a loaded, non-invalidated handle for `path`
    ///
    /// On a miss the sidecar is loaded once, however many callers ask for the
    /// same path at the same time. A failed load is returned to every waiter
    /// and retried by the next call.
    pub fn get(&self, path: &Path) -> KnnResult<Arc<NativeIndexHandle<E>>> {
        self.inner.ensure_open()?;
        validate_key(path)?;

        if let Some(handle) = self.inner.lookup(path) {
            self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
            debug!(target: "strata::knn::cache", path = %path.display(), "Cache hit");
            return Ok(handle);
        }
        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!(target: "strata::knn::cache", path = %path.display(), "Cache miss");
        self.inner.load_once(path)
    }

    /// Insert an index loaded outside the cache, replacing any existing entry
    pub fn put(&self, path: &Path, index: E::Index) -> KnnResult<Arc<NativeIndexHandle<E>>> {
        let handle = Arc::new(NativeIndexHandle::new(
            path.to_path_buf(),
            index,
            Arc::clone(&self.inner.engine),
        ));
        if let Err(e) = self.inner.ensure_open().and_then(|_| validate_key(path)) {
            self.inner.discard(handle);
            return Err(e);
        }
        self.inner.admit(path, handle)
    }

    /// Remove the entry for `path` and schedule its release
    ///
    /// Returns false if nothing was cached under `path`.
    pub fn invalidate(&self, path: &Path) -> bool {
        self.inner.remove(path, RemovalReason::Explicit)
    }

    /// Run one eviction sweep (idle expiry, then weight budget)
    ///
    /// Returns the number of entries removed.
    pub fn run_maintenance(&self) -> usize {
        self.inner.run_maintenance()
    }

    /// Whether `path` has a live entry. Does not count as an access.
    pub fn contains(&self, path: &Path) -> bool {
        self.inner.entries.read().map.contains_key(path)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.inner.entries.read().map.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of live entry weights
    pub fn weight_bytes(&self) -> u64 {
        self.inner.entries.read().weight
    }

    /// Cache configuration
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Engine the cache loads with
    pub fn engine(&self) -> &Arc<E> {
        &self.inner.engine
    }

    /// Block until every queued release has run
    pub fn drain_releases(&self) {
        self.inner.releaser.drain();
    }

    /// Metrics snapshot
    pub fn stats(&self) -> CacheStats {
        let (entries, weight_bytes) = {
            let entries = self.inner.entries.read();
            (entries.map.len(), entries.weight)
        };
        let counters = &self.inner.counters;
        let mut removals = [0u64; 6];
        for (slot, counter) in removals.iter_mut().zip(counters.removals.iter()) {
            *slot = counter.load(Ordering::Relaxed);
        }
        CacheStats {
            entries,
            weight_bytes,
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            loads: counters.loads.load(Ordering::Relaxed),
            load_failures: counters.load_failures.load(Ordering::Relaxed),
            removals,
            releases: counters.releases.load(Ordering::Relaxed),
            pending_releases: counters.pending_releases.load(Ordering::Relaxed),
        }
    }

    /// Whether `shutdown` has been called
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Invalidate every entry, run queued releases and stop background work
    ///
    /// Later `get` and `put` calls fail with `ShutDown`. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        self.sweeper_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.sweeper.lock().take() {
            let _ = handle.join();
        }

        let removed: Removed<E> = {
            let mut entries = self.inner.entries.write();
            let paths: Vec<PathBuf> = entries.map.keys().cloned().collect();
            paths
                .into_iter()
                .filter_map(|path| {
                    self.inner
                        .detach(&mut entries, &path, RemovalReason::Shutdown)
                        .map(|handle| (path, handle, RemovalReason::Shutdown))
                })
                .collect()
        };
        let count = removed.len();
        for (path, handle, reason) in removed {
            self.inner.finish_removal(&path, handle, reason);
        }

        self.inner.releaser.shutdown();
        info!(target: "strata::knn::cache", invalidated = count, "Handle cache shut down");
    }
}

impl<E: VectorEngine> Drop for HandleCache<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn validate_key(path: &Path) -> KnnResult<()> {
    if path.as_os_str().is_empty() {
        return Err(KnnError::InvalidKey("empty path".to_string()));
    }
    if path.file_name().is_none() {
        return Err(KnnError::InvalidKey(format!(
            "{} does not name a file",
            path.display()
        )));
    }
    Ok(())
}
