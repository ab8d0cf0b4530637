//! k-NN runtime
//!
//! Owns one of each component and wires them together: the watcher feeds
//! deletions into the cache, the executor reads from the cache, and the writer
//! builds through the same engine.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use strata_knn_core::{KnnConfig, KnnResult, CONFIG_FILE_NAME};

use crate::cache::HandleCache;
use crate::engine::VectorEngine;
use crate::executor::{KnnExecutor, KnnQuery, SearchOutcome, SegmentContext};
use crate::watcher::{FileLifecycleObserver, PollingFileWatcher};
use crate::writer::SidecarWriter;

/// Fully wired k-NN subsystem
pub struct KnnRuntime<E: VectorEngine> {
    config: KnnConfig,
    engine: Arc<E>,
    watcher: Option<Arc<PollingFileWatcher>>,
    cache: Arc<HandleCache<E>>,
    writer: SidecarWriter<E>,
    executor: KnnExecutor<E>,
    shut_down: AtomicBool,
}

impl<E: VectorEngine> KnnRuntime<E> {
    /// Validate `config` and start every component
    pub fn open(config: KnnConfig, engine: E) -> KnnResult<Self> {
        config.validate()?;
        let engine = Arc::new(engine);

        let watcher = if config.watcher.enabled {
            let watcher = Arc::new(PollingFileWatcher::new(config.watcher.poll_interval()));
            watcher.start()?;
            Some(watcher)
        } else {
            None
        };

        let mut builder = HandleCache::builder(Arc::clone(&engine), config.cache.clone());
        if let Some(watcher) = &watcher {
            let observer: Arc<dyn FileLifecycleObserver> = watcher.clone();
            builder = builder.observer(observer);
        }
        let cache = Arc::new(builder.build()?);

        let writer = SidecarWriter::new(Arc::clone(&engine), config.writer.clone());
        let executor = KnnExecutor::new(Arc::clone(&cache), config.query.clone());

        info!(
            target: "strata::knn::runtime",
            engine = engine.name(),
            watcher = watcher.is_some(),
            weight_budget = ?config.cache.weight_budget(),
            idle_timeout_ms = ?config.cache.idle_timeout().map(|d| d.as_millis() as u64),
            "k-NN runtime opened"
        );

        Ok(Self {
            config,
            engine,
            watcher,
            cache,
            writer,
            executor,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Open with the `knn.toml` found in `dir`, writing the default file
    /// first if there is none
    pub fn open_dir(dir: &Path, engine: E) -> KnnResult<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        KnnConfig::write_default_if_missing(&path)?;
        let config = KnnConfig::from_file(&path)?;
        Self::open(config, engine)
    }

    /// Active configuration
    pub fn config(&self) -> &KnnConfig {
        &self.config
    }

    /// Shared engine
    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Handle cache
    pub fn cache(&self) -> &Arc<HandleCache<E>> {
        &self.cache
    }

    /// Sidecar writer
    pub fn writer(&self) -> &SidecarWriter<E> {
        &self.writer
    }

    /// Query executor
    pub fn executor(&self) -> &KnnExecutor<E> {
        &self.executor
    }

    /// Polling watcher, when enabled
    pub fn watcher(&self) -> Option<&Arc<PollingFileWatcher>> {
        self.watcher.as_ref()
    }

    /// Search `segments` for `query`
    pub fn search(
        &self,
        segments: &[SegmentContext],
        query: &KnnQuery,
    ) -> KnnResult<SearchOutcome> {
        self.executor.search(segments, query)
    }

    /// Stop the watcher, shut the cache down and stop build workers. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(watcher) = &self.watcher {
            watcher.shutdown();
        }
        self.cache.shutdown();
        self.writer.shutdown();
        info!(target: "strata::knn::runtime", "k-NN runtime shut down");
    }
}

impl<E: VectorEngine> Drop for KnnRuntime<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
