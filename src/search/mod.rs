//! Similarity search: index management, execution, result caching and analytics
//!
//! Query flow:
//! 1. `ResultCache` is consulted with a normalized key
//! 2. on a miss `SearchExecutor` runs the indexed KNN path when `SearchIndex`
//!    is ready, else a brute-force scan over `VectorStore`
//! 3. filters, threshold, ordering and truncation are applied the same way
//!    whichever path produced the candidates
//! 4. `AnalyticsRecorder` is told about the search without holding up the caller

pub mod analytics;
pub mod cache;
pub mod executor;
pub mod index;

pub use analytics::{
    AnalyticsRecorder, AnalyticsSnapshot, HourlyUsage, LatencySummary, PopularQuery, SearchEvent,
    SearchRecord,
};
pub use cache::{CacheEntry, ResultCache, CACHE_PREFIX};
pub use executor::{ExecutionOutcome, SearchExecutor, SearchPath};
pub use index::{IndexState, IndexStatus, SearchIndex};

use crate::storage::KnnFilter;
use crate::vector::RecordMeta;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Restrictions on which chunks may be returned
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Every listed tag must be present on the chunk
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    /// Chunk must belong to one of these documents
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub doc_ids: BTreeSet<String>,
    /// Case-insensitive exact filename
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Inclusive lower bound on upload date
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on upload date
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_to: Option<DateTime<Utc>>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
            && self.doc_ids.is_empty()
            && self.filename.is_none()
            && self.date_from.is_none()
            && self.date_to.is_none()
    }

    pub fn matches(&self, meta: &RecordMeta) -> bool {
        self.check(&meta.doc_id, &meta.tags, &meta.filename, meta.upload_date)
    }

    pub fn matches_result(&self, result: &SearchResult) -> bool {
        self.check(
            &result.doc_id,
            &result.metadata.tags,
            &result.metadata.filename,
            result.metadata.upload_date,
        )
    }

    fn check(
        &self,
        doc_id: &str,
        tags: &BTreeSet<String>,
        filename: &str,
        upload_date: Option<DateTime<Utc>>,
    ) -> bool {
        if !self.tags.is_subset(tags) {
            return false;
        }

        if !self.doc_ids.is_empty() && !self.doc_ids.contains(doc_id) {
            return false;
        }

        if let Some(wanted) = &self.filename {
            if !filename.eq_ignore_ascii_case(wanted) {
                return false;
            }
        }

        if self.date_from.is_some() || self.date_to.is_some() {
            let Some(uploaded) = upload_date else {
                return false;
            };
            if self.date_from.is_some_and(|from| uploaded < from) {
                return false;
            }
            if self.date_to.is_some_and(|to| uploaded > to) {
                return false;
            }
        }

        true
    }

    /// The same restrictions in the form the index engine evaluates
    pub fn to_knn_filter(&self) -> KnnFilter {
        KnnFilter {
            doc_ids: self.doc_ids.iter().cloned().collect(),
            tags: self.tags.iter().cloned().collect(),
            filename: self.filename.clone(),
            uploaded_from: self.date_from,
            uploaded_to: self.date_to,
        }
    }
}

/// One search request. `None` limit/threshold fall back to configured defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub similarity_threshold: Option<f32>,
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(default = "default_true")]
    pub include_content: bool,
    #[serde(default = "default_true")]
    pub include_metadata: bool,
}

fn default_true() -> bool {
    true
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            limit: None,
            similarity_threshold: None,
            filters: SearchFilters::default(),
            include_content: true,
            include_metadata: true,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = Some(threshold);
        self
    }

    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_content(mut self, include: bool) -> Self {
        self.include_content = include;
        self
    }

    pub fn with_metadata(mut self, include: bool) -> Self {
        self.include_metadata = include;
        self
    }
}

/// Denormalized chunk metadata carried by every result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub title: String,
    pub filename: String,
    pub tags: BTreeSet<String>,
    pub word_count: u32,
    pub upload_date: Option<DateTime<Utc>>,
    pub embedding_method: String,
    pub embedding_model: String,
}

/// A ranked chunk, in the form stored in the result cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub doc_id: String,
    pub chunk_index: u32,
    /// Cosine similarity clamped to [0, 1]
    pub similarity_score: f32,
    pub content: String,
    pub metadata: ResultMetadata,
}

impl SearchResult {
    pub fn from_meta(meta: RecordMeta, similarity_score: f32) -> Self {
        Self {
            chunk_id: meta.chunk_id,
            doc_id: meta.doc_id,
            chunk_index: meta.chunk_index,
            similarity_score,
            content: meta.content,
            metadata: ResultMetadata {
                title: meta.title,
                filename: meta.filename,
                tags: meta.tags,
                word_count: meta.word_count,
                upload_date: meta.upload_date,
                embedding_method: meta.embedding_method,
                embedding_model: meta.embedding_model,
            },
        }
    }

    /// Drop the parts the caller did not ask for
    pub fn shape(&self, include_content: bool, include_metadata: bool) -> SearchHit {
        SearchHit {
            chunk_id: self.chunk_id.clone(),
            doc_id: self.doc_id.clone(),
            chunk_index: self.chunk_index,
            similarity_score: self.similarity_score,
            content: include_content.then(|| self.content.clone()),
            metadata: include_metadata.then(|| self.metadata.clone()),
        }
    }
}

/// A result as returned to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub doc_id: String,
    pub chunk_index: u32,
    pub similarity_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResultMetadata>,
}

/// Response of the query boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchHit>,
    pub total_results: usize,
    /// Seconds spent serving the request
    pub processing_time: f64,
    pub cached: bool,
}

/// Order by score descending, then chunk_index ascending, then chunk_id
pub fn rank_order(a: &SearchResult, b: &SearchResult) -> std::cmp::Ordering {
    b.similarity_score
        .total_cmp(&a.similarity_score)
        .then_with(|| a.chunk_index.cmp(&b.chunk_index))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}
