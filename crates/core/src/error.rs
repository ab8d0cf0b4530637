//! Error types for the k-NN subsystem
//!
//! Every payload is a plain string or integer so that a single error value can
//! be cloned and handed to every caller waiting on the same load.

use std::io;
use std::path::Path;
use thiserror::Error;

use crate::types::DocId;

/// Result type alias for k-NN operations
pub type KnnResult<T> = std::result::Result<T, KnnError>;

/// Errors produced by sidecar build, handle cache and query execution
#[derive(Debug, Clone, Error, PartialEq)]
pub enum KnnError {
    /// I/O error (file creation, rename, stat)
    #[error("I/O error: {0}")]
    Io(String),

    /// A document's binary value does not decode to a float vector
    #[error("Malformed vector for document {doc}: {reason}")]
    MalformedVector {
        /// Document whose value failed to decode
        doc: DocId,
        /// What was wrong with the encoding
        reason: String,
    },

    /// Vector dimension doesn't match the field's dimension
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Dimension fixed for the field in this segment
        expected: usize,
        /// Dimension of the offending vector
        got: usize,
    },

    /// The external engine failed to build a sidecar file
    #[error("Sidecar build failed for {path}: {reason}")]
    BuildFailed {
        /// Sidecar path that was being built
        path: String,
        /// Engine-reported reason
        reason: String,
    },

    /// The build worker did not finish within the configured timeout
    #[error("Sidecar build for {path} timed out after {timeout_ms}ms")]
    BuildTimeout {
        /// Sidecar path that was being built
        path: String,
        /// Configured timeout
        timeout_ms: u64,
    },

    /// The build worker queue is full or has been shut down
    #[error("Sidecar build for {path} rejected: build queue unavailable")]
    BuildRejected {
        /// Sidecar path that was being built
        path: String,
    },

    /// The external engine failed to load a sidecar file
    #[error("Failed to load sidecar {path}: {reason}")]
    LoadFailed {
        /// Sidecar path
        path: String,
        /// Engine-reported reason
        reason: String,
    },

    /// The external engine failed to answer a query
    #[error("Query against {path} failed: {reason}")]
    QueryFailed {
        /// Sidecar path
        path: String,
        /// Engine-reported reason
        reason: String,
    },

    /// More than one sidecar file matches a segment
    #[error("Illegal state: segment {segment} has {count} sidecar files, expected exactly one")]
    AmbiguousSidecar {
        /// Segment name
        segment: String,
        /// Number of matching files
        count: usize,
    },

    /// The handle was invalidated between cache lookup and use
    #[error("Handle for {path} was invalidated")]
    HandleInvalidated {
        /// Sidecar path
        path: String,
    },

    /// Every retry observed an invalidated handle
    #[error("Handle for {path} kept being evicted ({attempts} attempts)")]
    EvictionRace {
        /// Sidecar path
        path: String,
        /// Number of lookups performed
        attempts: usize,
    },

    /// A loaded handle is larger than the whole cache budget
    #[error("Handle for {path} weighs {size_bytes} bytes, over the {budget_bytes} byte budget")]
    WeightBudgetExceeded {
        /// Sidecar path
        path: String,
        /// Reported native size
        size_bytes: u64,
        /// Configured budget
        budget_bytes: u64,
    },

    /// Cache keys must be non-empty paths
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    /// Query parameters are invalid
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Configuration is invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The lifecycle watcher could not watch a file
    #[error("Cannot watch {path}: {reason}")]
    WatcherRegistration {
        /// Sidecar path
        path: String,
        /// Why registration failed
        reason: String,
    },

    /// The cache has been shut down
    #[error("Handle cache is shut down")]
    ShutDown,
}

impl KnnError {
    /// Build a `LoadFailed` error for a path
    pub fn load_failed(path: &Path, reason: impl Into<String>) -> Self {
        KnnError::LoadFailed {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }

    /// Build a `BuildFailed` error for a path
    pub fn build_failed(path: &Path, reason: impl Into<String>) -> Self {
        KnnError::BuildFailed {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }

    /// Build a `QueryFailed` error for a path
    pub fn query_failed(path: &Path, reason: impl Into<String>) -> Self {
        KnnError::QueryFailed {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }

    /// Integrity bugs that must fail a whole search rather than one segment
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, KnnError::AmbiguousSidecar { .. })
    }

    /// Errors caused by eviction racing a query
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KnnError::HandleInvalidated { .. } | KnnError::EvictionRace { .. }
        )
    }

    /// Errors that only cost recall for the segment that raised them
    pub fn is_segment_local(&self) -> bool {
        matches!(
            self,
            KnnError::LoadFailed { .. }
                | KnnError::QueryFailed { .. }
                | KnnError::HandleInvalidated { .. }
                | KnnError::EvictionRace { .. }
                | KnnError::WeightBudgetExceeded { .. }
                | KnnError::Io(_)
        )
    }
}

impl From<io::Error> for KnnError {
    fn from(e: io::Error) -> Self {
        KnnError::Io(e.to_string())
    }
}
