//! k-NN query executor
//!
//! Per segment: resolve the segment's sidecar, get a handle from the cache,
//! query it, and expose the results as a document-ordered scorer. Across
//! segments: collect scorers, record segments that failed, and merge the
//! survivors into a global top-k.
//!
//! Scores are distances as reported by the engine; lower is closer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use strata_knn_core::{
    has_sidecar_extension, DocId, KnnError, KnnResult, QueryConfig, QueryResult,
};

use crate::cache::HandleCache;
use crate::engine::VectorEngine;

/// Sentinel returned once a scorer is exhausted
pub const NO_MORE_DOCS: DocId = DocId::MAX;

/// A validated k-NN query
#[derive(Debug, Clone, PartialEq)]
pub struct KnnQuery {
    field: String,
    vector: Vec<f32>,
    k: usize,
}

impl KnnQuery {
    /// Validate and build a query
    pub fn new(field: impl Into<String>, vector: Vec<f32>, k: usize) -> KnnResult<Self> {
        let field = field.into();
        if field.is_empty() {
            return Err(KnnError::InvalidQuery("field name is empty".to_string()));
        }
        if vector.is_empty() {
            return Err(KnnError::InvalidQuery("query vector is empty".to_string()));
        }
        if let Some(pos) = vector.iter().position(|v| !v.is_finite()) {
            return Err(KnnError::InvalidQuery(format!(
                "query vector has a non-finite value at position {}",
                pos
            )));
        }
        if k == 0 {
            return Err(KnnError::InvalidQuery("k must be at least 1".to_string()));
        }
        Ok(Self { field, vector, k })
    }

    /// Queried field
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Query vector
    pub fn vector(&self) -> &[f32] {
        &self.vector
    }

    /// Number of neighbors requested per segment
    pub fn k(&self) -> usize {
        self.k
    }
}

/// What the executor needs to know about one segment
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentContext {
    /// Directory holding the segment's files
    pub directory: PathBuf,
    /// Segment name
    pub name: String,
    /// File names belonging to the segment
    pub files: Vec<String>,
    /// Whether the segment is packed in a compound container
    pub compound: bool,
    /// Global id of the segment's document 0
    pub doc_base: DocId,
}

impl SegmentContext {
    /// Non-compound segment starting at global doc 0
    pub fn new(directory: impl Into<PathBuf>, name: impl Into<String>, files: Vec<String>) -> Self {
        Self {
            directory: directory.into(),
            name: name.into(),
            files,
            compound: false,
            doc_base: 0,
        }
    }

    /// Set the compound flag
    pub fn with_compound(mut self, compound: bool) -> Self {
        self.compound = compound;
        self
    }

    /// Set the global doc base
    pub fn with_doc_base(mut self, doc_base: DocId) -> Self {
        self.doc_base = doc_base;
        self
    }

    /// Locate the segment's sidecar
    ///
    /// `None` means the field has no vectors in this segment. More than one
    /// candidate is an integrity error.
    pub fn resolve_sidecar(&self) -> KnnResult<Option<PathBuf>> {
        let mut matches = self
            .files
            .iter()
            .filter(|name| has_sidecar_extension(name, self.compound));
        let first = match matches.next() {
            Some(name) => name,
            None => return Ok(None),
        };
        let extra = matches.count();
        if extra > 0 {
            return Err(KnnError::AmbiguousSidecar {
                segment: self.name.clone(),
                count: extra + 1,
            });
        }
        Ok(Some(self.directory.join(first)))
    }
}

/// Document-ordered view over one segment's results
///
/// Iterates like a postings list; `score_of` answers for any returned doc
/// without touching the engine again.
#[derive(Debug, Clone, Default)]
pub struct KnnScorer {
    docs: Vec<DocId>,
    scores: HashMap<DocId, f32>,
    cursor: Option<usize>,
}

impl KnnScorer {
    /// Scorer with no matches
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from unordered engine results; a repeated doc keeps its best score
    pub fn from_results(results: Vec<QueryResult>) -> Self {
        let mut scores: HashMap<DocId, f32> = HashMap::with_capacity(results.len());
        for result in results {
            scores
                .entry(result.doc)
                .and_modify(|score| *score = score.min(result.score))
                .or_insert(result.score);
        }
        let mut docs: Vec<DocId> = scores.keys().copied().collect();
        docs.sort_unstable();
        Self {
            docs,
            scores,
            cursor: None,
        }
    }

    /// Number of matched documents
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Whether nothing matched
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Current document, or `None` before the first `next_doc` and after
    /// exhaustion
    pub fn doc_id(&self) -> Option<DocId> {
        self.cursor.and_then(|i| self.docs.get(i)).copied()
    }

    /// Score of the current document
    pub fn score(&self) -> Option<f32> {
        self.doc_id().and_then(|doc| self.score_of(doc))
    }

    /// Score of any matched document
    pub fn score_of(&self, doc: DocId) -> Option<f32> {
        self.scores.get(&doc).copied()
    }

    /// Move to the next document
    pub fn next_doc(&mut self) -> DocId {
        let next = self.cursor.map_or(0, |i| i + 1).min(self.docs.len());
        self.cursor = Some(next);
        self.docs.get(next).copied().unwrap_or(NO_MORE_DOCS)
    }

    /// Move to the first document at or after `target`, never backwards
    pub fn advance(&mut self, target: DocId) -> DocId {
        let from = self.cursor.map_or(0, |i| i + 1).min(self.docs.len());
        let next = from + self.docs[from..].partition_point(|&doc| doc < target);
        self.cursor = Some(next);
        self.docs.get(next).copied().unwrap_or(NO_MORE_DOCS)
    }

    /// Matches in document order
    pub fn hits(&self) -> impl Iterator<Item = QueryResult> + '_ {
        self.docs
            .iter()
            .map(move |&doc| QueryResult::new(doc, self.scores[&doc]))
    }
}

/// Matches contributed by one segment
#[derive(Debug, Clone)]
pub struct SegmentHits {
    /// Segment name
    pub segment: String,
    /// Global id of the segment's document 0
    pub doc_base: DocId,
    /// Segment-local matches
    pub scorer: KnnScorer,
}

/// A segment that could not be searched
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentFailure {
    /// Segment name
    pub segment: String,
    /// Why it failed
    pub error: KnnError,
}

/// Result of a multi-segment search
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    /// Segments searched successfully
    pub hits: Vec<SegmentHits>,
    /// Segments that contributed nothing because of an error
    pub failures: Vec<SegmentFailure>,
}

impl SearchOutcome {
    /// Whether some segment failed
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Best `k` matches across segments under global ids, closest first
    ///
    /// Equal scores are ordered by global id.
    pub fn top_k(&self, k: usize) -> Vec<QueryResult> {
        let mut all: Vec<QueryResult> = self
            .hits
            .iter()
            .flat_map(|segment| {
                segment
                    .scorer
                    .hits()
                    .map(move |hit| QueryResult::new(segment.doc_base + hit.doc, hit.score))
            })
            .collect();
        all.sort_by(|a, b| a.score.total_cmp(&b.score).then(a.doc.cmp(&b.doc)));
        all.truncate(k);
        all
    }
}

/// Runs k-NN queries against segments through the handle cache
pub struct KnnExecutor<E: VectorEngine> {
    cache: Arc<HandleCache<E>>,
    config: QueryConfig,
}

impl<E: VectorEngine> KnnExecutor<E> {
    /// Create an executor over `cache`
    pub fn new(cache: Arc<HandleCache<E>>, config: QueryConfig) -> Self {
        Self { cache, config }
    }

    /// Cache the executor reads handles from
    pub fn cache(&self) -> &Arc<HandleCache<E>> {
        &self.cache
    }

    fn check_k(&self, query: &KnnQuery) -> KnnResult<()> {
        if query.k() > self.config.max_k {
            return Err(KnnError::InvalidQuery(format!(
                "k = {} exceeds the maximum of {}",
                query.k(),
                self.config.max_k
            )));
        }
        Ok(())
    }

    /// Query one segment
    pub fn search_segment(
        &self,
        segment: &SegmentContext,
        query: &KnnQuery,
    ) -> KnnResult<KnnScorer> {
        self.check_k(query)?;
        let path = match segment.resolve_sidecar()? {
            Some(path) => path,
            None => {
                debug!(
                    target: "strata::knn::query",
                    segment = %segment.name,
                    field = %query.field(),
                    "No sidecar in segment"
                );
                return Ok(KnnScorer::empty());
            }
        };
        let results = self.query_handle(&path, query)?;
        Ok(KnnScorer::from_results(results))
    }

    /// Get a live handle for `path` and query it, going back to the cache a
    /// bounded number of times when eviction wins the race
    fn query_handle(&self, path: &Path, query: &KnnQuery) -> KnnResult<Vec<QueryResult>> {
        let attempts = self.config.eviction_retries + 1;
        for attempt in 1..=attempts {
            let handle = self.cache.get(path)?;
            if !handle.is_invalidated() {
                match handle.query(query.vector(), query.k()) {
                    Ok(results) => return Ok(results),
                    Err(KnnError::HandleInvalidated { .. }) => {}
                    Err(e @ KnnError::QueryFailed { .. }) => return Err(e),
                    Err(e) => return Err(KnnError::query_failed(path, e.to_string())),
                }
            }
            if attempt < attempts {
                info!(
                    target: "strata::knn::query",
                    path = %path.display(),
                    attempt,
                    "Handle evicted during query, retrying"
                );
            }
        }
        Err(KnnError::EvictionRace {
            path: path.display().to_string(),
            attempts,
        })
    }

    /// Query every segment
    ///
    /// Segment-local failures only cost that segment's matches and are listed
    /// in the outcome. Integrity errors and invalid queries fail the search.
    pub fn search(
        &self,
        segments: &[SegmentContext],
        query: &KnnQuery,
    ) -> KnnResult<SearchOutcome> {
        self.check_k(query)?;
        let mut outcome = SearchOutcome::default();
        for segment in segments {
            match self.search_segment(segment, query) {
                Ok(scorer) => outcome.hits.push(SegmentHits {
                    segment: segment.name.clone(),
                    doc_base: segment.doc_base,
                    scorer,
                }),
                Err(e) if e.is_segment_local() => {
                    warn!(
                        target: "strata::knn::query",
                        segment = %segment.name,
                        field = %query.field(),
                        error = %e,
                        "Segment not searchable"
                    );
                    outcome.failures.push(SegmentFailure {
                        segment: segment.name.clone(),
                        error: e,
                    });
                }
                Err(e) => {
                    if e.is_illegal_state() {
                        error!(
                            target: "strata::knn::query",
                            segment = %segment.name,
                            error = %e,
                            "Illegal sidecar state"
                        );
                    }
                    return Err(e);
                }
            }
        }
        Ok(outcome)
    }
}
