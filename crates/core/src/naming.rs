//! Sidecar file naming
//!
//! A sidecar's name is derived from the owning segment only:
//! `<segment>[_<engine tag>].<extension>`. Segments stored in a compound
//! container carry their sidecar under the compound extension instead.

use std::path::{Path, PathBuf};

/// Extension of a sidecar written next to a regular segment
pub const SIDECAR_EXTENSION: &str = "hnsw";
/// Extension of a sidecar copied out of a compound segment
pub const COMPOUND_SIDECAR_EXTENSION: &str = "hnswc";

/// Extension to look for, given the segment's storage layout
pub fn sidecar_extension(compound: bool) -> &'static str {
    if compound {
        COMPOUND_SIDECAR_EXTENSION
    } else {
        SIDECAR_EXTENSION
    }
}

/// File name of the sidecar for `segment`
pub fn sidecar_file_name(segment: &str, engine_tag: Option<&str>, compound: bool) -> String {
    let ext = sidecar_extension(compound);
    match engine_tag {
        Some(tag) if !tag.is_empty() => format!("{}_{}.{}", segment, tag, ext),
        _ => format!("{}.{}", segment, ext),
    }
}

/// Full path of the sidecar for `segment` inside `directory`
pub fn sidecar_path(directory: &Path, segment: &str, engine_tag: Option<&str>) -> PathBuf {
    directory.join(sidecar_file_name(segment, engine_tag, false))
}

/// Whether a file name carries the given sidecar extension
pub fn has_sidecar_extension(file_name: &str, compound: bool) -> bool {
    Path::new(file_name)
        .extension()
        .map(|ext| ext == sidecar_extension(compound))
        .unwrap_or(false)
}
