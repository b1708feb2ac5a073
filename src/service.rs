//! `DocumentCache`: indexing, removal and search over one backing store
//!
//! This is the call surface request handlers and the CLI use. It owns one
//! instance of every search component and wires them together:
//!
//! ```text
//! search:  validate -> ResultCache -> Embedder -> SearchExecutor -> ResultCache -> analytics
//! index:   VectorStore upsert -> stale record cleanup -> cache invalidation -> analytics
//! ```

use crate::config::Config;
use crate::embedding::{Embedder, EmbeddingProvider};
use crate::error::{DocCacheError, Result};
use crate::search::{
    AnalyticsRecorder, IndexStatus, ResultCache, SearchEvent, SearchExecutor, SearchIndex,
    SearchQuery, SearchResponse,
};
use crate::storage::{open_store, KvStore, StoreClient};
use crate::vector::{
    Chunk, ChunkEmbedding, DeleteReport, PurgeReport, RecordFailure, VectorCodec, VectorRecord,
    VectorStore,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// Outcome of indexing one document
#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub doc_id: String,
    /// Vectors actually written
    pub vectors_stored: usize,
    /// Records of an earlier version of the document that were removed
    pub vectors_removed: usize,
    /// Chunks that could not be stored
    pub failures: Vec<RecordFailure>,
    /// No records existed for this document before
    pub new_document: bool,
}

impl IndexReport {
    /// Some chunks were not stored
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VectorStats {
    pub backend: String,
    pub total_vectors: usize,
    pub vectors_created: i64,
    pub vectors_deleted: i64,
    pub index_name: String,
    pub index_ready: bool,
    pub cached_searches: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexInfo {
    #[serde(flatten)]
    pub status: IndexStatus,
    pub exists: bool,
    pub vector_count: usize,
}

pub struct DocumentCache {
    config: Config,
    client: StoreClient,
    store: VectorStore,
    index: Arc<SearchIndex>,
    executor: SearchExecutor,
    cache: ResultCache,
    analytics: AnalyticsRecorder,
    embedder: Embedder,
}

impl DocumentCache {
    /// Open the configured backend and bring the vector index up.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn open(config: Config, provider: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let backend = open_store(&config)?;
        Self::with_store(config, backend, provider).await
    }

    /// Build over an already opened backend
    pub async fn with_store(
        config: Config,
        backend: Arc<dyn KvStore>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let client = StoreClient::new(backend, config.timeouts.store());
        client.ping().await?;

        let embedder = Embedder::new(provider, &config.embedding, config.timeouts.embedding())?;
        let store = VectorStore::new(
            client.clone(),
            VectorCodec::new(config.embedding.dimension),
            config.index.prefix.clone(),
            config.search.scan_batch_size,
        );
        let index = Arc::new(SearchIndex::from_config(client.clone(), &config));
        index.ensure_ready().await?;

        let executor = SearchExecutor::new(Arc::clone(&index), store.clone(), &config.search);
        let cache = ResultCache::new(client.clone(), &config.cache);
        let analytics = AnalyticsRecorder::new(client.clone(), &config.analytics);

        tracing::info!(
            "Document cache ready: backend={}, index={} ({}), model={} ({}D)",
            client.backend_name(),
            index.name(),
            if index.is_ready() { "ready" } else { "brute force" },
            embedder.model(),
            embedder.dimension()
        );

        Ok(Self {
            config,
            client,
            store,
            index,
            executor,
            cache,
            analytics,
            embedder,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    pub fn vector_store(&self) -> &VectorStore {
        &self.store
    }

    pub fn index(&self) -> &SearchIndex {
        &self.index
    }

    pub fn analytics(&self) -> &AnalyticsRecorder {
        &self.analytics
    }

    /// Replace the stored vectors of `doc_id` with the given chunks.
    ///
    /// `embeddings[i]` belongs to `chunks[i]`. Chunks that cannot be stored
    /// (no embedding, wrong dimension, foreign doc_id) are reported without
    /// failing the document. Records from a previous version that are not
    /// part of the new set are removed after the new ones are written.
    pub async fn index_document(
        &self,
        doc_id: &str,
        chunks: &[Chunk],
        embeddings: Vec<ChunkEmbedding>,
    ) -> Result<IndexReport> {
        let (previous, _) = self.store.doc_chunk_ids(doc_id).await?;

        let mut failures = Vec::new();
        if embeddings.len() < chunks.len() {
            for chunk in &chunks[embeddings.len()..] {
                tracing::warn!("Chunk {} of {} has no embedding", chunk.chunk_id, doc_id);
                failures.push(RecordFailure {
                    chunk_id: chunk.chunk_id.clone(),
                    reason: "no embedding supplied".to_string(),
                });
            }
        }

        let content_max_chars = self.config.search.content_max_chars;
        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| VectorRecord::from_chunk(chunk, embedding, content_max_chars))
            .collect();

        let upsert = self.store.upsert_batch(doc_id, &records).await?;
        failures.extend(upsert.failures);

        let rejected: HashSet<&str> = failures.iter().map(|f| f.chunk_id.as_str()).collect();
        let written: HashSet<&str> = records
            .iter()
            .map(|r| r.chunk_id())
            .filter(|id| !rejected.contains(id))
            .collect();
        let stale: Vec<String> = previous
            .iter()
            .filter(|id| !written.contains(id.as_str()))
            .cloned()
            .collect();
        let vectors_removed = self.store.delete_chunks(&stale).await?;

        let report = IndexReport {
            doc_id: doc_id.to_string(),
            vectors_stored: upsert.written,
            vectors_removed,
            new_document: previous.is_empty() && upsert.written > 0,
            failures,
        };

        self.invalidate_cache().await?;
        self.analytics.record(SearchEvent::DocumentIndexed {
            doc_id: doc_id.to_string(),
            vectors_created: report.vectors_stored,
            vectors_deleted: report.vectors_removed,
            new_document: report.new_document,
            at: Utc::now(),
        });

        if report.is_partial() {
            tracing::warn!(
                "Indexed {} with {} of {} chunks ({} failed)",
                doc_id,
                report.vectors_stored,
                chunks.len(),
                report.failures.len()
            );
        } else {
            tracing::info!(
                "Indexed {}: {} vectors stored, {} stale removed",
                doc_id,
                report.vectors_stored,
                report.vectors_removed
            );
        }

        Ok(report)
    }

    /// Embed chunk texts with the configured provider, then index them
    pub async fn embed_and_index(&self, doc_id: &str, chunks: &[Chunk]) -> Result<IndexReport> {
        let embeddings = self.embedder.embed_chunks(chunks).await?;
        self.index_document(doc_id, chunks, embeddings).await
    }

    /// Delete every vector of a document
    pub async fn remove_document(&self, doc_id: &str) -> Result<DeleteReport> {
        let report = self.store.delete_by_doc(doc_id).await?;

        if report.deleted > 0 {
            self.invalidate_cache().await?;
            self.analytics.record(SearchEvent::DocumentRemoved {
                doc_id: doc_id.to_string(),
                vectors_deleted: report.deleted,
                at: Utc::now(),
            });
        }

        tracing::info!("Removed {}: {} vectors deleted", doc_id, report.deleted);
        Ok(report)
    }

    /// Answer a natural-language query.
    ///
    /// An empty result list is a successful search; failures of the store or
    /// the embedding collaborator come back as errors.
    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResponse> {
        let started = Instant::now();
        let (limit, threshold) = self.validate(query)?;

        let generation = self.cache.generation().await?;
        let key = ResultCache::key(generation, &query.text, limit, threshold, &query.filters);
        let (results, cached) = match self.cache.get(&key).await? {
            Some(entry) => {
                tracing::debug!("Cache hit for '{}'", query.text);
                (entry.results, true)
            }
            None => {
                let query_vector = self.embedder.embed(&query.text).await?;
                let outcome = self
                    .executor
                    .search(&query_vector, limit, threshold, &query.filters)
                    .await?;

                if let Err(e) = self.cache.put(&key, &outcome.results).await {
                    tracing::warn!("Failed to cache results for '{}': {}", query.text, e);
                }

                tracing::debug!(
                    "Search '{}' served by {:?} path ({} scanned, {} skipped)",
                    query.text,
                    outcome.path,
                    outcome.scanned,
                    outcome.skipped
                );
                (outcome.results, false)
            }
        };

        let elapsed = started.elapsed();
        self.analytics.record(SearchEvent::Completed {
            query: query.text.clone(),
            cached,
            results: results.len(),
            latency: elapsed,
            at: Utc::now(),
        });

        tracing::info!(
            "Search '{}' returned {} results in {:.3}s (cached: {})",
            query.text,
            results.len(),
            elapsed.as_secs_f64(),
            cached
        );

        let hits: Vec<_> = results
            .iter()
            .map(|r| r.shape(query.include_content, query.include_metadata))
            .collect();

        Ok(SearchResponse {
            query: query.text.clone(),
            total_results: hits.len(),
            results: hits,
            processing_time: elapsed.as_secs_f64(),
            cached,
        })
    }

    fn validate(&self, query: &SearchQuery) -> Result<(usize, f32)> {
        if query.text.trim().is_empty() {
            return Err(DocCacheError::InvalidQuery("query text is empty".to_string()));
        }

        let limit = query.limit.unwrap_or(self.config.search.default_limit);
        if limit == 0 || limit > self.config.search.max_limit {
            return Err(DocCacheError::InvalidQuery(format!(
                "limit must be between 1 and {}, got {}",
                self.config.search.max_limit, limit
            )));
        }

        let threshold = query
            .similarity_threshold
            .unwrap_or(self.config.search.similarity_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(DocCacheError::InvalidQuery(format!(
                "similarity threshold must be between 0.0 and 1.0, got {}",
                threshold
            )));
        }

        Ok((limit, threshold))
    }

    async fn invalidate_cache(&self) -> Result<()> {
        if self.cache.is_enabled() && self.config.cache.invalidate_on_write {
            self.cache.clear().await?;
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<VectorStats> {
        let total_vectors = self.store.count().await?;
        let snapshot = self.analytics.snapshot().await?;
        let cached_searches = self.cache.entry_count().await?;

        Ok(VectorStats {
            backend: self.client.backend_name().to_string(),
            total_vectors,
            vectors_created: snapshot.vectors_created,
            vectors_deleted: snapshot.vectors_deleted,
            index_name: self.index.name().to_string(),
            index_ready: self.index.is_ready(),
            cached_searches,
        })
    }

    pub async fn index_info(&self) -> Result<IndexInfo> {
        let status = self.index.status().await?;
        let vector_count = self.store.count().await?;
        Ok(IndexInfo {
            exists: status.engine.is_some(),
            status,
            vector_count,
        })
    }

    /// Drop the index and every stored vector, then recreate the index.
    ///
    /// Returns the number of records deleted.
    pub async fn reset_index(&self) -> Result<usize> {
        self.index.drop_index().await?;
        let deleted = self.store.delete_all().await?;
        self.index.ensure_ready().await?;
        self.cache.clear().await?;
        self.analytics.record(SearchEvent::IndexReset {
            vectors_deleted: deleted,
            at: Utc::now(),
        });

        tracing::warn!("Vector index '{}' reset, {} records deleted", self.index.name(), deleted);
        Ok(deleted)
    }

    /// Delete stored records that no longer decode
    pub async fn cleanup_corrupt_vectors(&self) -> Result<PurgeReport> {
        self.store.purge_corrupt().await
    }

    pub async fn clear_cache(&self) -> Result<usize> {
        self.cache.clear().await
    }

    /// Wait for queued analytics events to land
    pub async fn flush_analytics(&self) {
        self.analytics.flush().await;
    }

    pub async fn shutdown(self) {
        self.analytics.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbeddingProvider;
    use crate::storage::MemoryStore;

    async fn service() -> DocumentCache {
        let mut config = Config::default();
        config.storage.backend = "memory".to_string();
        config.embedding.provider = "hash".to_string();
        config.embedding.dimension = 64;
        DocumentCache::with_store(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(HashEmbeddingProvider::new(64)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_rejects_bad_queries() {
        let service = service().await;

        for query in [
            SearchQuery::new("   "),
            SearchQuery::new("q").with_limit(0),
            SearchQuery::new("q").with_limit(51),
            SearchQuery::new("q").with_threshold(1.5),
            SearchQuery::new("q").with_threshold(f32::NAN),
        ] {
            assert!(matches!(
                service.search(&query).await,
                Err(DocCacheError::InvalidQuery(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_reindex_removes_stale_chunks() {
        let service = service().await;
        let chunks: Vec<Chunk> = (0..3)
            .map(|i| Chunk::new("d1", i, format!("chunk number {}", i)))
            .collect();
        let first = service.embed_and_index("d1", &chunks).await.unwrap();
        assert_eq!(first.vectors_stored, 3);
        assert!(first.new_document);

        let second = service.embed_and_index("d1", &chunks[..1]).await.unwrap();
        assert_eq!(second.vectors_stored, 1);
        assert_eq!(second.vectors_removed, 2);
        assert!(!second.new_document);
        assert_eq!(service.vector_store().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_embeddings_are_partial_success() {
        let service = service().await;
        let chunks = vec![Chunk::new("d1", 0, "alpha"), Chunk::new("d1", 1, "beta")];
        let embeddings = vec![ChunkEmbedding::new(vec![0.1; 64], "hash", "test")];

        let report = service.index_document("d1", &chunks, embeddings).await.unwrap();
        assert_eq!(report.vectors_stored, 1);
        assert!(report.is_partial());
        assert_eq!(report.failures[0].chunk_id, chunks[1].chunk_id);
    }

    #[tokio::test]
    async fn test_reset_index_clears_vectors() {
        let service = service().await;
        let chunks = vec![Chunk::new("d1", 0, "alpha beta")];
        service.embed_and_index("d1", &chunks).await.unwrap();

        assert_eq!(service.reset_index().await.unwrap(), 1);
        let info = service.index_info().await.unwrap();
        assert!(info.exists);
        assert_eq!(info.vector_count, 0);
    }
}
