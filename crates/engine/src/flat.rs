//! Flat L2 reference engine
//!
//! Exact Euclidean search over a memory-mapped sidecar file. It stands in for
//! a native ANN library: same build/load/query/release contract, and the same
//! scoring (distance in the `l2` space, lower is closer).
//!
//! ## File Format (Version 1)
//!
//! ```text
//! [magic "KNNF" 4B]
//! [version u32 LE]
//! [dimension u32 LE]
//! [count u64 LE]
//! [doc ids: count * u32 LE]
//! [vectors: count * dimension * f32 LE]
//! [crc32 u32 LE]   (over every preceding byte)
//! ```

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use memmap2::Mmap;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use strata_knn_core::{DocId, KnnError, KnnResult, QueryResult};

use crate::engine::VectorEngine;

/// Magic bytes identifying a flat sidecar file
const MAGIC: &[u8; 4] = b"KNNF";
/// Current format version
const VERSION: u32 = 1;
/// Header size: magic(4) + version(4) + dimension(4) + count(8)
const HEADER_SIZE: usize = 4 + 4 + 4 + 8;
/// Trailing checksum size
const CHECKSUM_SIZE: usize = 4;

/// Brute-force L2 engine writing memory-mappable sidecars
#[derive(Debug, Clone)]
pub struct FlatL2Engine {
    tag: String,
}

impl Default for FlatL2Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl FlatL2Engine {
    /// Create the engine
    pub fn new() -> Self {
        Self {
            tag: format!("flat{}", VERSION),
        }
    }
}

/// A loaded flat sidecar
pub struct FlatIndex {
    mmap: Mmap,
    dimension: usize,
    count: usize,
    vectors_offset: usize,
}

impl std::fmt::Debug for FlatIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatIndex")
            .field("dimension", &self.dimension)
            .field("count", &self.count)
            .field("mapped_bytes", &self.mmap.len())
            .finish()
    }
}

impl FlatIndex {
    /// Vector dimension
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of indexed vectors
    pub fn len(&self) -> usize {
        self.count
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn doc_at(&self, i: usize) -> DocId {
        let start = HEADER_SIZE + i * 4;
        LittleEndian::read_u32(&self.mmap[start..start + 4])
    }

    fn vector_bytes(&self, i: usize) -> &[u8] {
        let stride = self.dimension * 4;
        let start = self.vectors_offset + i * stride;
        &self.mmap[start..start + stride]
    }
}

/// Heap entry ordered by distance (max-heap keeps the worst on top)
struct Candidate {
    distance: f32,
    doc: DocId,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.doc.cmp(&other.doc))
    }
}

fn l2_distance(encoded: &[u8], query: &[f32]) -> f32 {
    encoded
        .chunks_exact(4)
        .zip(query)
        .map(|(chunk, q)| {
            let d = LittleEndian::read_f32(chunk) - q;
            d * d
        })
        .sum::<f32>()
        .sqrt()
}

impl VectorEngine for FlatL2Engine {
    type Index = FlatIndex;

    fn name(&self) -> &str {
        "flat-l2"
    }

    fn version_tag(&self) -> Option<&str> {
        Some(&self.tag)
    }

    fn build(&self, ids: &[DocId], vectors: &[Vec<f32>], output: &Path) -> KnnResult<()> {
        if ids.len() != vectors.len() {
            return Err(KnnError::build_failed(
                output,
                format!("{} ids for {} vectors", ids.len(), vectors.len()),
            ));
        }
        let dimension = vectors.first().map(Vec::len).unwrap_or(0);
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(KnnError::DimensionMismatch {
                expected: dimension,
                got: bad.len(),
            });
        }

        let mut buf =
            Vec::with_capacity(HEADER_SIZE + ids.len() * (4 + dimension * 4) + CHECKSUM_SIZE);
        buf.extend_from_slice(MAGIC);
        buf.write_u32::<LittleEndian>(VERSION)?;
        buf.write_u32::<LittleEndian>(dimension as u32)?;
        buf.write_u64::<LittleEndian>(ids.len() as u64)?;
        for &id in ids {
            buf.write_u32::<LittleEndian>(id)?;
        }
        for vector in vectors {
            for &value in vector {
                buf.write_f32::<LittleEndian>(value)?;
            }
        }
        let checksum = crc32fast::hash(&buf);
        buf.write_u32::<LittleEndian>(checksum)?;

        let mut file = File::create(output)
            .map_err(|e| KnnError::build_failed(output, e.to_string()))?;
        file.write_all(&buf)
            .map_err(|e| KnnError::build_failed(output, e.to_string()))?;
        file.sync_all()
            .map_err(|e| KnnError::build_failed(output, e.to_string()))?;
        Ok(())
    }

    fn load(&self, path: &Path) -> KnnResult<FlatIndex> {
        let file = File::open(path).map_err(|e| KnnError::load_failed(path, e.to_string()))?;
        // SAFETY: the mapping is read-only and sidecars are immutable once written.
        let mmap =
            unsafe { Mmap::map(&file) }.map_err(|e| KnnError::load_failed(path, e.to_string()))?;

        if mmap.len() < HEADER_SIZE + CHECKSUM_SIZE {
            return Err(KnnError::load_failed(path, "file too small for header"));
        }
        if &mmap[0..4] != MAGIC {
            return Err(KnnError::load_failed(path, "invalid magic"));
        }
        let version = LittleEndian::read_u32(&mmap[4..8]);
        if version != VERSION {
            return Err(KnnError::load_failed(
                path,
                format!("unsupported version: {}", version),
            ));
        }
        let dimension = LittleEndian::read_u32(&mmap[8..12]) as usize;
        let count = LittleEndian::read_u64(&mmap[12..20]) as usize;

        let sizes = count.checked_mul(4).and_then(|ids| {
            let vectors_offset = HEADER_SIZE.checked_add(ids)?;
            let expected_len = count
                .checked_mul(dimension)?
                .checked_mul(4)?
                .checked_add(vectors_offset)?
                .checked_add(CHECKSUM_SIZE)?;
            Some((vectors_offset, expected_len))
        });
        let (vectors_offset, expected_len) =
            sizes.ok_or_else(|| KnnError::load_failed(path, "header overflows"))?;
        if mmap.len() != expected_len {
            return Err(KnnError::load_failed(
                path,
                format!("length {} != expected {}", mmap.len(), expected_len),
            ));
        }

        let body = mmap.len() - CHECKSUM_SIZE;
        let stored = LittleEndian::read_u32(&mmap[body..]);
        if crc32fast::hash(&mmap[..body]) != stored {
            return Err(KnnError::load_failed(path, "checksum mismatch"));
        }

        Ok(FlatIndex {
            mmap,
            dimension,
            count,
            vectors_offset,
        })
    }

    fn query(&self, index: &FlatIndex, vector: &[f32], k: usize) -> KnnResult<Vec<QueryResult>> {
        if vector.len() != index.dimension {
            return Err(KnnError::DimensionMismatch {
                expected: index.dimension,
                got: vector.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);
        for i in 0..index.count {
            let candidate = Candidate {
                distance: l2_distance(index.vector_bytes(i), vector),
                doc: index.doc_at(i),
            };
            if heap.len() < k {
                heap.push(candidate);
            } else if heap.peek().map(|worst| candidate < *worst).unwrap_or(false) {
                heap.pop();
                heap.push(candidate);
            }
        }

        Ok(heap
            .into_vec()
            .into_iter()
            .map(|c| QueryResult::new(c.doc, c.distance))
            .collect())
    }

    fn release(&self, index: FlatIndex) {
        drop(index);
    }

    fn index_size(&self, index: &FlatIndex) -> u64 {
        index.mmap.len() as u64
    }
}
