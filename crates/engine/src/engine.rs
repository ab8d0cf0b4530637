//! External vector engine adapter
//!
//! The native k-NN library is consumed as a black box with four operations:
//! build a sidecar file, load it into a native index, query the index, and
//! release it. Everything about graph construction and distance computation
//! stays behind this trait.

use std::path::Path;

use strata_knn_core::{DocId, KnnResult, QueryResult};

/// Trait for an opaque native vector-search engine
///
/// IMPORTANT: `release` consumes the index, so the type system guarantees it
/// is called at most once per loaded index. Callers other than the handle
/// cache never see an `Index` by value.
pub trait VectorEngine: Send + Sync + 'static {
    /// Loaded native index state
    type Index: Send + Sync + 'static;

    /// Short engine name, used in logs
    fn name(&self) -> &str;

    /// Build version tag embedded in sidecar file names
    fn version_tag(&self) -> Option<&str> {
        None
    }

    /// Build an index over `vectors` and write exactly one file at `output`
    ///
    /// `ids[i]` is the document of `vectors[i]`. Synchronous.
    fn build(&self, ids: &[DocId], vectors: &[Vec<f32>], output: &Path) -> KnnResult<()>;

    /// Load a sidecar file into memory
    ///
    /// Fails if the file is absent or corrupt.
    fn load(&self, path: &Path) -> KnnResult<Self::Index>;

    /// Return at most `k` matches for `vector`, in no particular order
    fn query(&self, index: &Self::Index, vector: &[f32], k: usize) -> KnnResult<Vec<QueryResult>>;

    /// Free the native index
    ///
    /// Never called while a query against the same index is in flight.
    fn release(&self, index: Self::Index);

    /// Native memory held by the index, used as its cache weight
    fn index_size(&self, index: &Self::Index) -> u64;

    /// Whether concurrent `query` calls on one index are safe
    ///
    /// When false, each handle serializes its queries internally.
    fn supports_concurrent_queries(&self) -> bool {
        true
    }
}
