/// Embedding collaborator
///
/// The core consumes vectors of a fixed dimensionality through a single
/// interface:
/// - EmbeddingProvider trait for abstraction
/// - FastEmbedProvider for local embedding (all-MiniLM-L6-v2, 384-dim)
/// - HashEmbeddingProvider for deterministic, download-free vectors
/// - Embedder adding deadlines, dimension checks and a small cache
mod cache;
mod embedder;
mod provider;

pub use cache::EmbeddingCache;
pub use embedder::Embedder;
pub use provider::{EmbeddingError, EmbeddingProvider, FastEmbedProvider, HashEmbeddingProvider};

use crate::config::EmbeddingConfig;
use crate::error::{DocCacheError, Result};
use std::sync::Arc;

/// Build the provider named by configuration
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "fastembed" => Ok(Arc::new(FastEmbedProvider::new(&config.model)?)),
        "hash" => Ok(Arc::new(HashEmbeddingProvider::new(config.dimension))),
        other => Err(DocCacheError::InvalidConfigValue {
            path: "embedding.provider".to_string(),
            message: format!("Unknown provider '{}'", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_hash_provider() {
        let mut config = crate::config::Config::default().embedding;
        config.provider = "hash".to_string();
        config.dimension = 32;

        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.dimension(), 32);
        assert_eq!(provider.method(), "hash");
    }

    #[test]
    fn test_unknown_provider() {
        let mut config = crate::config::Config::default().embedding;
        config.provider = "openai".to_string();
        assert!(create_provider(&config).is_err());
    }
}
