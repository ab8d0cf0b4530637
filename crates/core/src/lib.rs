//! Core types for Strata k-NN sidecar indexes
//!
//! This crate defines the pieces shared by every layer of the k-NN subsystem:
//! - Error taxonomy (`KnnError`, `KnnResult`)
//! - Data model (`VectorRecord`, `QueryResult`, `SidecarIndexFile`)
//! - Configuration loaded from `knn.toml`
//! - Deterministic sidecar file naming
//! - Binary field value codec for fixed-width float vectors
//!
//! It knows nothing about native engines or caching; those live in
//! `strata-knn-engine`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod config;
pub mod error;
pub mod naming;
pub mod types;

pub use codec::{decode_vector, encode_vector};
pub use config::{
    CacheConfig, KnnConfig, QueryConfig, WatchFrequency, WatcherConfig, WriterConfig,
    CONFIG_FILE_NAME,
};
pub use error::{KnnError, KnnResult};
pub use naming::{
    has_sidecar_extension, sidecar_extension, sidecar_file_name, sidecar_path,
    COMPOUND_SIDECAR_EXTENSION, SIDECAR_EXTENSION,
};
pub use types::{DocId, QueryResult, SidecarIndexFile, VectorRecord};
