//! Data model shared by the writer, cache and query paths

use std::path::{Path, PathBuf};

/// Segment-local document identifier
pub type DocId = u32;

/// One document's vector, decoded from the segment's binary field values
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    /// Document id in the (new) segment's id space
    pub doc: DocId,
    /// Fixed-width vector
    pub vector: Vec<f32>,
}

impl VectorRecord {
    /// Create a record
    pub fn new(doc: DocId, vector: Vec<f32>) -> Self {
        Self { doc, vector }
    }

    /// Vector dimension
    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

/// A single match returned by the external engine
///
/// `score` is the engine's distance for the match: lower is closer.
/// A result list is neither sorted nor deduplicated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryResult {
    /// Matched document
    pub doc: DocId,
    /// Engine distance to the query vector
    pub score: f32,
}

impl QueryResult {
    /// Create a result
    pub fn new(doc: DocId, score: f32) -> Self {
        Self { doc, score }
    }
}

/// A sidecar index file produced for one segment
///
/// Immutable once written. Deleted only by the host engine, together with the
/// segment that owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct SidecarIndexFile {
    /// Absolute path of the sidecar
    pub path: PathBuf,
    /// Owning segment
    pub segment: String,
    /// Number of vectors indexed
    pub record_count: usize,
    /// Vector dimension
    pub dimension: usize,
}

impl SidecarIndexFile {
    /// Path as a cache key
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name component, as the host lists it among the segment's files
    pub fn file_name(&self) -> Option<String> {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }
}
