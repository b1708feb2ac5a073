/// Async facade over the embedding provider
use super::cache::EmbeddingCache;
use super::provider::EmbeddingProvider;
use crate::config::EmbeddingConfig;
use crate::error::{DocCacheError, Result};
use crate::vector::record::truncate_chars;
use crate::vector::{Chunk, ChunkEmbedding};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Runs provider calls off the async runtime under a deadline and
/// guarantees every returned vector has the configured dimension.
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    dimension: usize,
    batch_size: usize,
    max_text_length: usize,
    timeout: Duration,
    cache: Option<Mutex<EmbeddingCache>>,
}

impl Embedder {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        config: &EmbeddingConfig,
        timeout: Duration,
    ) -> Result<Self> {
        if provider.dimension() != config.dimension {
            return Err(DocCacheError::DimensionMismatch {
                expected: config.dimension,
                actual: provider.dimension(),
            });
        }

        Ok(Self {
            provider,
            dimension: config.dimension,
            batch_size: config.batch_size.max(1),
            max_text_length: config.max_text_length,
            timeout,
            cache: (config.cache_capacity > 0)
                .then(|| Mutex::new(EmbeddingCache::new(config.cache_capacity))),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn method(&self) -> &str {
        self.provider.method()
    }

    pub fn model(&self) -> &str {
        self.provider.model_name()
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| DocCacheError::EmbeddingUnavailable("provider returned nothing".to_string()))
    }

    /// Embed texts in provider-sized batches, one vector per input in order
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut pending: Vec<(usize, String)> = Vec::new();

        for (position, text) in texts.iter().enumerate() {
            let text = truncate_chars(text, self.max_text_length);
            if text.trim().is_empty() {
                // Degenerate embedding; scores 0.0 against every query
                results[position] = Some(vec![0.0; self.dimension]);
            } else if let Some(vector) = self.cached(text) {
                results[position] = Some(vector);
            } else {
                pending.push((position, text.to_string()));
            }
        }

        for batch in pending.chunks(self.batch_size) {
            let inputs: Vec<String> = batch.iter().map(|(_, text)| text.clone()).collect();
            let vectors = self.call_provider(inputs).await?;

            for ((position, text), vector) in batch.iter().zip(vectors) {
                self.remember(text, &vector);
                results[*position] = Some(vector);
            }
        }

        results
            .into_iter()
            .map(|v| v.ok_or_else(|| DocCacheError::EmbeddingUnavailable("missing embedding".to_string())))
            .collect()
    }

    /// Embed chunk texts and attach provenance
    pub async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<ChunkEmbedding>> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embed_batch(&texts).await?;
        Ok(vectors
            .into_iter()
            .map(|vector| ChunkEmbedding::new(vector, self.method(), self.model()))
            .collect())
    }

    async fn call_provider(&self, inputs: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let provider = Arc::clone(&self.provider);
        let expected = inputs.len();
        let task = tokio::task::spawn_blocking(move || provider.embed_batch(&inputs));

        let vectors = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_error)) => {
                return Err(DocCacheError::EmbeddingUnavailable(format!(
                    "embedding task failed: {}",
                    join_error
                )))
            }
            Err(_) => {
                tracing::warn!("Embedding call exceeded {}ms", self.timeout.as_millis());
                return Err(DocCacheError::Timeout {
                    operation: "embed".to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
        };

        if vectors.len() != expected {
            return Err(DocCacheError::EmbeddingUnavailable(format!(
                "provider returned {} vectors for {} texts",
                vectors.len(),
                expected
            )));
        }
        for vector in &vectors {
            if vector.len() != self.dimension {
                return Err(DocCacheError::DimensionMismatch {
                    expected: self.dimension,
                    actual: vector.len(),
                });
            }
        }

        tracing::debug!("Embedded {} texts with {}", expected, self.provider.model_name());
        Ok(vectors)
    }

    fn cached(&self, text: &str) -> Option<Vec<f32>> {
        let cache = self.cache.as_ref()?;
        cache.lock().ok()?.get(text)
    }

    fn remember(&self, text: &str, vector: &[f32]) {
        if let Some(cache) = &self.cache {
            if let Ok(mut cache) = cache.lock() {
                cache.insert(text.to_string(), vector.to_vec());
            }
        }
    }

    /// Embedding cache (hits, misses), if the cache is enabled
    pub fn cache_counters(&self) -> Option<(u64, u64)> {
        let cache = self.cache.as_ref()?;
        cache.lock().ok().map(|c| c.counters())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::provider::{EmbeddingError, HashEmbeddingProvider};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        inner: HashEmbeddingProvider,
        calls: AtomicUsize,
    }

    impl EmbeddingProvider for CountingProvider {
        fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed(text)
        }
        fn dimension(&self) -> usize {
            self.inner.dimension()
        }
        fn model_name(&self) -> &str {
            self.inner.model_name()
        }
        fn method(&self) -> &str {
            "counting"
        }
    }

    struct SlowProvider;

    impl EmbeddingProvider for SlowProvider {
        fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(vec![1.0; 4])
        }
        fn dimension(&self) -> usize {
            4
        }
        fn model_name(&self) -> &str {
            "slow"
        }
        fn method(&self) -> &str {
            "slow"
        }
    }

    struct WrongLengthProvider;

    impl EmbeddingProvider for WrongLengthProvider {
        fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
            Ok(vec![1.0; 3])
        }
        fn dimension(&self) -> usize {
            4
        }
        fn model_name(&self) -> &str {
            "liar"
        }
        fn method(&self) -> &str {
            "liar"
        }
    }

    fn config(dimension: usize, cache_capacity: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "hash".to_string(),
            model: "test".to_string(),
            dimension,
            batch_size: 2,
            max_text_length: 64,
            cache_capacity,
        }
    }

    #[tokio::test]
    async fn test_cache_avoids_repeat_calls() {
        let provider = Arc::new(CountingProvider {
            inner: HashEmbeddingProvider::new(8),
            calls: AtomicUsize::new(0),
        });
        let embedder = Embedder::new(provider.clone(), &config(8, 16), Duration::from_secs(5)).unwrap();

        let first = embedder.embed("hello world").await.unwrap();
        let second = embedder.embed("hello world").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(embedder.cache_counters(), Some((1, 1)));
    }

    #[tokio::test]
    async fn test_batch_keeps_order_and_zero_fills_empty() {
        let provider = Arc::new(HashEmbeddingProvider::new(8));
        let embedder = Embedder::new(provider.clone(), &config(8, 0), Duration::from_secs(5)).unwrap();

        let texts = vec![
            "alpha".to_string(),
            "".to_string(),
            "beta".to_string(),
            "gamma".to_string(),
        ];
        let vectors = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), 4);
        assert_eq!(vectors[0], provider.embed("alpha").unwrap());
        assert!(vectors[1].iter().all(|v| *v == 0.0));
        assert_eq!(vectors[3], provider.embed("gamma").unwrap());
    }

    #[tokio::test]
    async fn test_timeout_is_distinct() {
        let embedder =
            Embedder::new(Arc::new(SlowProvider), &config(4, 0), Duration::from_millis(20)).unwrap();
        let err = embedder.embed("anything").await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_wrong_length_rejected() {
        let embedder =
            Embedder::new(Arc::new(WrongLengthProvider), &config(4, 0), Duration::from_secs(5))
                .unwrap();
        assert!(matches!(
            embedder.embed("anything").await,
            Err(DocCacheError::DimensionMismatch { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn test_provider_dimension_must_match_config() {
        let result = Embedder::new(
            Arc::new(HashEmbeddingProvider::new(8)),
            &config(16, 0),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(DocCacheError::DimensionMismatch { .. })));
    }
}
