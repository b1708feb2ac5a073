//! Query execution over the indexed path or a brute-force scan

use super::index::SearchIndex;
use super::{rank_order, SearchFilters, SearchResult};
use crate::config::SearchConfig;
use crate::error::Result;
use crate::vector::{cosine_similarity, similarity_score, RecordMeta, VectorStore};
use serde::Serialize;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

/// Which candidate source served a search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchPath {
    Indexed,
    BruteForce,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub results: Vec<SearchResult>,
    pub path: SearchPath,
    /// Records examined by the scan path (0 on the indexed path)
    pub scanned: usize,
    /// Unreadable records skipped along the way
    pub skipped: usize,
}

pub struct SearchExecutor {
    index: Arc<SearchIndex>,
    store: VectorStore,
    candidate_floor: f32,
    overscan_factor: usize,
}

impl SearchExecutor {
    pub fn new(index: Arc<SearchIndex>, store: VectorStore, config: &SearchConfig) -> Self {
        Self {
            index,
            store,
            candidate_floor: config.candidate_floor,
            overscan_factor: config.overscan_factor.max(1),
        }
    }

    /// Rank stored chunks against a query vector.
    ///
    /// A failing index query falls back to the scan for this call only. Store
    /// failures during the scan abort the search.
    pub async fn search(
        &self,
        query_vector: &[f32],
        limit: usize,
        threshold: f32,
        filters: &SearchFilters,
    ) -> Result<ExecutionOutcome> {
        self.store.codec().check_dimension(query_vector)?;

        if limit == 0 {
            return Ok(ExecutionOutcome {
                results: Vec::new(),
                path: SearchPath::BruteForce,
                scanned: 0,
                skipped: 0,
            });
        }

        let candidate_limit = limit.saturating_mul(self.overscan_factor);

        if self.index.is_ready() {
            match self.indexed_candidates(query_vector, candidate_limit, filters).await {
                Ok((candidates, skipped)) => {
                    return Ok(ExecutionOutcome {
                        results: finalize(candidates, limit, threshold, filters),
                        path: SearchPath::Indexed,
                        scanned: 0,
                        skipped,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        "Index query on '{}' failed, falling back to scan: {}",
                        self.index.name(),
                        e
                    );
                }
            }
        }

        let (candidates, scanned, skipped) = self
            .scan_candidates(query_vector, candidate_limit, filters)
            .await?;

        Ok(ExecutionOutcome {
            results: finalize(candidates, limit, threshold, filters),
            path: SearchPath::BruteForce,
            scanned,
            skipped,
        })
    }

    async fn indexed_candidates(
        &self,
        query_vector: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Result<(Vec<SearchResult>, usize)> {
        let hits = self.index.knn_search(query_vector, k, filters).await?;

        let mut skipped = 0;
        let mut candidates = Vec::with_capacity(hits.len());
        for hit in hits {
            match RecordMeta::from_fields(&hit.key, self.store.prefix(), &hit.fields) {
                Ok(meta) => {
                    // Engine reports cosine distance
                    let score = similarity_score(1.0 - hit.distance);
                    if score < self.candidate_floor {
                        continue;
                    }
                    candidates.push(SearchResult::from_meta(meta, score));
                }
                Err(e) => {
                    skipped += 1;
                    tracing::warn!("Skipping unreadable index hit {}: {}", hit.key, e);
                }
            }
        }

        Ok((candidates, skipped))
    }

    async fn scan_candidates(
        &self,
        query_vector: &[f32],
        keep: usize,
        filters: &SearchFilters,
    ) -> Result<(Vec<SearchResult>, usize, usize)> {
        let mut heap: BinaryHeap<Reverse<Ranked>> = BinaryHeap::with_capacity(keep + 1);
        let mut scan = self.store.scan_all();

        while let Some(batch) = scan.next_batch().await? {
            for record in batch {
                if !filters.matches(&record.meta) {
                    continue;
                }

                let score = similarity_score(cosine_similarity(query_vector, &record.vector));
                if score < self.candidate_floor {
                    continue;
                }

                heap.push(Reverse(Ranked(SearchResult::from_meta(record.meta, score))));
                if heap.len() > keep {
                    heap.pop();
                }
            }
        }

        tracing::debug!(
            "Scanned {} records ({} skipped), kept {} candidates",
            scan.scanned(),
            scan.skipped(),
            heap.len()
        );

        let candidates = heap.into_iter().map(|Reverse(Ranked(r))| r).collect();
        Ok((candidates, scan.scanned(), scan.skipped()))
    }
}

/// Heap wrapper: "greater" means ranked earlier
struct Ranked(SearchResult);

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        rank_order(&other.0, &self.0)
    }
}

/// Filters, threshold, ordering and truncation shared by both paths
fn finalize(
    candidates: Vec<SearchResult>,
    limit: usize,
    threshold: f32,
    filters: &SearchFilters,
) -> Vec<SearchResult> {
    let mut results: Vec<SearchResult> = candidates
        .into_iter()
        .filter(|r| r.similarity_score >= threshold)
        .filter(|r| filters.matches_result(r))
        .collect();

    results.sort_by(rank_order);
    results.truncate(limit);
    results
}
