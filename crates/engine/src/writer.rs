//! Vector extraction and sidecar writer
//!
//! Runs at segment flush and merge time. Per-document field values are decoded
//! into `VectorRecord`s in the new segment's document-id space and handed to
//! the engine's build, which produces the segment's sidecar file.
//!
//! # Build Protocol
//!
//! 1. Decode every value on the writer thread; a malformed value aborts the
//!    segment write
//! 2. Create an empty file at the final sidecar path, so the host's file
//!    tracking owns it from the start
//! 3. Build into `<final>.tmp` on the bounded build pool while the writer
//!    thread waits, optionally with a timeout
//! 4. On success rename the temporary file over the marker; on failure or
//!    timeout remove both, so no partial sidecar is ever referenced

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use strata_knn_core::{
    decode_vector, has_sidecar_extension, sidecar_path, DocId, KnnError, KnnResult,
    SidecarIndexFile, VectorRecord, WriterConfig, COMPOUND_SIDECAR_EXTENSION,
};

use crate::engine::VectorEngine;
use crate::worker::WorkerPool;

/// Identity of the segment being written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentWriteState {
    /// Directory holding the segment's files
    pub directory: PathBuf,
    /// Segment name, e.g. `_0`
    pub segment_name: String,
}

impl SegmentWriteState {
    /// Describe a segment
    pub fn new(directory: impl Into<PathBuf>, segment_name: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            segment_name: segment_name.into(),
        }
    }
}

/// Old to new document-id remapping for one merge input
///
/// `None` marks a document that does not survive the merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocMap(Vec<Option<DocId>>);

impl DocMap {
    /// Mapping indexed by old document id
    pub fn new(mapping: Vec<Option<DocId>>) -> Self {
        Self(mapping)
    }

    /// Map old ids `0..len` to `base..base + len`
    pub fn shifted(len: usize, base: DocId) -> Self {
        Self((0..len as DocId).map(|doc| Some(base + doc)).collect())
    }

    /// New id of `old`, or `None` if it was deleted or is out of range
    pub fn get(&self, old: DocId) -> Option<DocId> {
        self.0.get(old as usize).copied().flatten()
    }

    /// Number of surviving documents
    pub fn live_count(&self) -> usize {
        self.0.iter().filter(|doc| doc.is_some()).count()
    }
}

/// Sequential `(document id, raw bytes)` stream for one segment's field
pub type ValueStream<'a> = Box<dyn Iterator<Item = KnnResult<(DocId, Vec<u8>)>> + 'a>;

/// One segment being merged away
pub struct MergeInput<'a> {
    values: ValueStream<'a>,
    doc_map: DocMap,
}

impl<'a> MergeInput<'a> {
    /// Pair a segment's values with its remapping
    pub fn new<I>(values: I, doc_map: DocMap) -> Self
    where
        I: IntoIterator<Item = KnnResult<(DocId, Vec<u8>)>>,
        I::IntoIter: 'a,
    {
        Self {
            values: Box::new(values.into_iter()),
            doc_map,
        }
    }
}

/// Streaming k-way merge of input value streams in new document-id order
///
/// Each input yields its values in ascending old id order and its mapping
/// preserves that order. Deleted documents are skipped; a new id produced by
/// more than one input is kept from the first input only.
struct MergedValues<'a> {
    inputs: Vec<MergeInput<'a>>,
    heads: Vec<Option<Vec<u8>>>,
    heap: BinaryHeap<Reverse<(DocId, usize)>>,
    started: bool,
    last: Option<DocId>,
    duplicates: usize,
}

impl<'a> MergedValues<'a> {
    fn new(inputs: Vec<MergeInput<'a>>) -> Self {
        let heads = (0..inputs.len()).map(|_| None).collect();
        Self {
            inputs,
            heads,
            heap: BinaryHeap::new(),
            started: false,
            last: None,
            duplicates: 0,
        }
    }

    /// Pull the next surviving value of input `idx` into the heap
    fn refill(&mut self, idx: usize) -> KnnResult<()> {
        let input = &mut self.inputs[idx];
        for item in input.values.by_ref() {
            let (old, bytes) = item?;
            if let Some(new) = input.doc_map.get(old) {
                self.heads[idx] = Some(bytes);
                self.heap.push(Reverse((new, idx)));
                break;
            }
        }
        Ok(())
    }
}

impl Iterator for MergedValues<'_> {
    type Item = KnnResult<(DocId, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            for idx in 0..self.inputs.len() {
                if let Err(e) = self.refill(idx) {
                    return Some(Err(e));
                }
            }
        }

        loop {
            let Reverse((doc, idx)) = self.heap.pop()?;
            let bytes = self.heads[idx].take();
            if let Err(e) = self.refill(idx) {
                return Some(Err(e));
            }
            if self.last == Some(doc) {
                self.duplicates += 1;
                continue;
            }
            if let Some(bytes) = bytes {
                self.last = Some(doc);
                return Some(Ok((doc, bytes)));
            }
        }
    }
}

/// Writes one sidecar per segment through the engine's build
pub struct SidecarWriter<E: VectorEngine> {
    engine: Arc<E>,
    config: WriterConfig,
    builders: WorkerPool,
}

impl<E: VectorEngine> SidecarWriter<E> {
    /// Create a writer with its build pool
    pub fn new(engine: Arc<E>, config: WriterConfig) -> Self {
        let builders = WorkerPool::new(
            "knn-build",
            config.build_threads.max(1),
            config.build_queue_depth,
        );
        Self {
            engine,
            config,
            builders,
        }
    }

    /// Writer configuration
    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Build the sidecar for a freshly flushed segment
    ///
    /// Returns `None` when no document has a value, in which case no file is
    /// created.
    pub fn write_flush<I>(
        &self,
        state: &SegmentWriteState,
        values: I,
    ) -> KnnResult<Option<SidecarIndexFile>>
    where
        I: IntoIterator<Item = KnnResult<(DocId, Vec<u8>)>>,
    {
        self.write_records(state, values.into_iter())
    }

    /// Build the sidecar for a segment produced by merging `inputs`
    ///
    /// Only documents that survive the merge are indexed, under their new ids.
    pub fn write_merge(
        &self,
        state: &SegmentWriteState,
        inputs: Vec<MergeInput<'_>>,
    ) -> KnnResult<Option<SidecarIndexFile>> {
        let mut merged = MergedValues::new(inputs);
        let written = self.write_records(state, &mut merged)?;
        if merged.duplicates > 0 {
            warn!(
                target: "strata::knn::writer",
                segment = %state.segment_name,
                duplicates = merged.duplicates,
                "Merge inputs mapped several documents to one id"
            );
        }
        Ok(written)
    }

    fn write_records(
        &self,
        state: &SegmentWriteState,
        values: impl Iterator<Item = KnnResult<(DocId, Vec<u8>)>>,
    ) -> KnnResult<Option<SidecarIndexFile>> {
        let mut records: Vec<VectorRecord> = Vec::new();
        for item in values {
            let (doc, bytes) = item?;
            let expected = records.first().map(VectorRecord::dimension);
            records.push(VectorRecord::new(doc, decode_vector(doc, &bytes, expected)?));
        }

        let Some(dimension) = records.first().map(VectorRecord::dimension) else {
            debug!(
                target: "strata::knn::writer",
                segment = %state.segment_name,
                "No vectors, skipping sidecar"
            );
            return Ok(None);
        };
        let record_count = records.len();
        let (ids, vectors): (Vec<DocId>, Vec<Vec<f32>>) =
            records.into_iter().map(|r| (r.doc, r.vector)).unzip();

        let path = sidecar_path(
            &state.directory,
            &state.segment_name,
            self.engine.version_tag(),
        );
        self.build(&path, ids, vectors)?;

        info!(
            target: "strata::knn::writer",
            path = %path.display(),
            records = record_count,
            dimension,
            "Sidecar built"
        );
        Ok(Some(SidecarIndexFile {
            path,
            segment: state.segment_name.clone(),
            record_count,
            dimension,
        }))
    }

    fn build(&self, path: &Path, ids: Vec<DocId>, vectors: Vec<Vec<f32>>) -> KnnResult<()> {
        fs::File::create(path)?;
        let tmp = temp_path(path);
        let started = Instant::now();

        let (tx, rx) = mpsc::sync_channel(1);
        let abandoned = Arc::new(AtomicBool::new(false));
        let job = {
            let engine = Arc::clone(&self.engine);
            let tmp = tmp.clone();
            let abandoned = Arc::clone(&abandoned);
            move || {
                let result = engine.build(&ids, &vectors, &tmp);
                if abandoned.load(Ordering::Acquire) {
                    let _ = fs::remove_file(&tmp);
                    return;
                }
                let _ = tx.send(result);
            }
        };
        if self.builders.submit(job).is_err() {
            remove_quietly(path);
            warn!(target: "strata::knn::writer", path = %path.display(), "Build queue unavailable");
            return Err(KnnError::BuildRejected {
                path: path.display().to_string(),
            });
        }

        let outcome = match self.config.build_timeout() {
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => {
                    abandoned.store(true, Ordering::Release);
                    remove_quietly(&tmp);
                    remove_quietly(path);
                    warn!(
                        target: "strata::knn::writer",
                        path = %path.display(),
                        timeout_ms = timeout.as_millis() as u64,
                        "Sidecar build timed out"
                    );
                    return Err(KnnError::BuildTimeout {
                        path: path.display().to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => Err(worker_lost(path)),
            },
            None => rx.recv().unwrap_or_else(|_| Err(worker_lost(path))),
        };

        let outcome = outcome.and_then(|()| fs::rename(&tmp, path).map_err(KnnError::from));
        if let Err(e) = outcome {
            remove_quietly(&tmp);
            remove_quietly(path);
            warn!(
                target: "strata::knn::writer",
                path = %path.display(),
                error = %e,
                "Sidecar build failed"
            );
            return Err(e);
        }
        debug!(
            target: "strata::knn::writer",
            path = %path.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Build finished"
        );
        Ok(())
    }

    /// Stop the build pool after running queued builds. Idempotent.
    pub fn shutdown(&self) {
        self.builders.shutdown();
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn worker_lost(path: &Path) -> KnnError {
    KnnError::build_failed(path, "build worker exited without a result")
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(
                target: "strata::knn::writer",
                path = %path.display(),
                error = %e,
                "Cleanup failed"
            );
        }
    }
}

/// Prepare a segment's files for packing into a compound container
///
/// Engine-built sidecars cannot carry the container's headers, so each
/// `*.hnsw` file is copied to its `*.hnswc` twin next to the container and the
/// raw names are dropped from the list of files to pack.
pub fn prepare_compound(directory: &Path, files: &[String]) -> KnnResult<Vec<String>> {
    let mut packed = Vec::with_capacity(files.len());
    for name in files {
        if has_sidecar_extension(name, false) {
            let source = directory.join(name);
            let target = source.with_extension(COMPOUND_SIDECAR_EXTENSION);
            fs::copy(&source, &target)?;
            debug!(
                target: "strata::knn::writer",
                from = %source.display(),
                to = %target.display(),
                "Copied sidecar out of compound segment"
            );
        } else {
            packed.push(name.clone());
        }
    }
    Ok(packed)
}
