//! Native index lifecycle for Strata k-NN
//!
//! This crate owns everything between segment files and native indexes:
//! - Engine adapter: the opaque build/load/query/release contract
//! - Sidecar writer: one engine-built file per flushed or merged segment
//! - Handle cache: single-flight loads, LRU weight and idle eviction,
//!   releases on a background worker
//! - File lifecycle watcher: evicts handles whose sidecar was deleted
//! - Query executor: resolve, get, query, retry on eviction races
//! - Runtime: wires the above together from a `KnnConfig`
//!
//! The cache is the only component that releases native indexes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod clock;
pub mod engine;
pub mod executor;
pub mod flat;
pub mod handle;
pub mod runtime;
pub mod testing;
pub mod watcher;
pub mod worker;
pub mod writer;

pub use cache::{CacheStats, HandleCache, HandleCacheBuilder, RemovalReason};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::VectorEngine;
pub use executor::{
    KnnExecutor, KnnQuery, KnnScorer, SearchOutcome, SegmentContext, SegmentFailure,
    SegmentHits, NO_MORE_DOCS,
};
pub use flat::{FlatIndex, FlatL2Engine};
pub use handle::NativeIndexHandle;
pub use runtime::KnnRuntime;
pub use watcher::{DeletionCallback, FileLifecycleObserver, PollingFileWatcher};
pub use worker::{BackpressureError, WorkerPool, WorkerStats};
pub use writer::{
    prepare_compound, DocMap, MergeInput, SegmentWriteState, SidecarWriter, ValueStream,
};
