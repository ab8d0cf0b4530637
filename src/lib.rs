//! Strata k-NN - native index lifecycle for segment-based search
//!
//! Every immutable segment gets a companion sidecar index built by an opaque
//! vector engine. This crate builds those sidecars at flush and merge time,
//! keeps loaded indexes warm in a concurrent cache, evicts them by weight,
//! idle time or segment deletion, and answers k-NN queries across segments.
//!
//! # Quick Start
//!
//! ```ignore
//! use strata_knn::{
//!     FlatL2Engine, KnnConfig, KnnQuery, KnnRuntime, SegmentContext, SegmentWriteState,
//! };
//!
//! let runtime = KnnRuntime::open(KnnConfig::default(), FlatL2Engine::new())?;
//!
//! // At segment flush
//! let state = SegmentWriteState::new(dir, "_0");
//! let sidecar = runtime.writer().write_flush(&state, values)?;
//!
//! // At search time
//! let query = KnnQuery::new("embedding", vec![0.1, 0.2, 0.3], 10)?;
//! let outcome = runtime.search(&segments, &query)?;
//! for hit in outcome.top_k(10) {
//!     println!("{} {}", hit.doc, hit.score);
//! }
//! ```
//!
//! # Architecture
//!
//! - [`strata_knn_core`]: errors, data model, configuration, file naming
//! - [`strata_knn_engine`]: engine adapter, handle cache, watcher, writer,
//!   executor and the [`KnnRuntime`] that wires them

pub use strata_knn_core::*;
pub use strata_knn_engine::*;
