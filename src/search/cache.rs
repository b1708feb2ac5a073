//! Memoized search responses
//!
//! Entries expire by TTL only; there is no request coalescing, so concurrent
//! identical misses each run the search and each write an equivalent entry.
//!
//! Every `clear` bumps a generation counter that is part of each key. A
//! search that started before a clear writes under the old generation, where
//! no later lookup reads it.

use super::{SearchFilters, SearchResult};
use crate::config::CacheConfig;
use crate::error::{DocCacheError, Result};
use crate::storage::StoreClient;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Key namespace of cached responses
pub const CACHE_PREFIX: &str = "cache:search:";

/// Counter bumped on every clear, outside `CACHE_PREFIX`
pub const GENERATION_KEY: &str = "cache:generation";

/// zstd level for large payloads
const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub results: Vec<SearchResult>,
    pub cached_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

pub struct ResultCache {
    client: StoreClient,
    enabled: bool,
    ttl: Duration,
    compress_threshold: usize,
}

impl ResultCache {
    pub fn new(client: StoreClient, config: &CacheConfig) -> Self {
        Self {
            client,
            enabled: config.enabled,
            ttl: Duration::from_secs(config.ttl_secs),
            compress_threshold: config.compress_threshold,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Deterministic key for a request within one cache generation.
    ///
    /// Query text is taken verbatim, the threshold is fixed to six decimals
    /// and filters serialize with sorted members, so equal requests always
    /// produce equal keys.
    pub fn key(
        generation: i64,
        text: &str,
        limit: usize,
        threshold: f32,
        filters: &SearchFilters,
    ) -> String {
        let filters = serde_json::to_string(filters).unwrap_or_default();
        let canonical = format!(
            "gen={}\u{1f}text={}\u{1f}limit={}\u{1f}threshold={:.6}\u{1f}filters={}",
            generation, text, limit, threshold, filters
        );
        format!("{}{}", CACHE_PREFIX, blake3::hash(canonical.as_bytes()).to_hex())
    }

    /// Current generation; read it before running the search a key is for
    pub async fn generation(&self) -> Result<i64> {
        if !self.enabled {
            return Ok(0);
        }

        let raw = self
            .client
            .call("cache_generation", |store| store.get(GENERATION_KEY))
            .await?;
        Ok(raw
            .and_then(|v| String::from_utf8_lossy(&v).trim().parse().ok())
            .unwrap_or(0))
    }

    /// Cached entry, `None` on a miss or an expired or unreadable entry
    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        if !self.enabled {
            return Ok(None);
        }

        let lookup = key.to_string();
        let Some(payload) = self
            .client
            .call("cache_get", move |store| store.get(&lookup))
            .await?
        else {
            return Ok(None);
        };

        match decode_entry(&payload) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                tracing::warn!("Ignoring unreadable cache entry {}: {}", key, e);
                Ok(None)
            }
        }
    }

    pub async fn put(&self, key: &str, results: &[SearchResult]) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let entry = CacheEntry {
            key: key.to_string(),
            results: results.to_vec(),
            cached_at: Utc::now(),
            ttl_secs: self.ttl.as_secs(),
        };
        let payload = encode_entry(&entry, self.compress_threshold)?;

        let key = key.to_string();
        let ttl = self.ttl;
        self.client
            .call("cache_set", move |store| store.set(&key, &payload, Some(ttl)))
            .await
    }

    /// Remove every cached response, returning how many were removed
    pub async fn clear(&self) -> Result<usize> {
        // Bump first so in-flight searches land under a dead generation
        self.client
            .call("cache_generation", |store| store.incr_by(GENERATION_KEY, 1))
            .await?;

        let cleared = self
            .client
            .call("cache_clear", |store| store.del_prefix(CACHE_PREFIX))
            .await?;
        if cleared > 0 {
            tracing::info!("Cleared {} cached search results", cleared);
        }
        Ok(cleared)
    }

    /// Number of live cached responses
    pub async fn entry_count(&self) -> Result<usize> {
        self.client
            .call("cache_count", |store| store.count_prefix(CACHE_PREFIX))
            .await
    }
}

fn encode_entry(entry: &CacheEntry, compress_threshold: usize) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(entry).map_err(|e| DocCacheError::Json {
        source: e,
        context: "Failed to serialize cache entry".to_string(),
    })?;

    if json.len() < compress_threshold {
        return Ok(json);
    }

    zstd::encode_all(&json[..], COMPRESSION_LEVEL).map_err(|e| DocCacheError::Io {
        source: e,
        context: "Failed to compress cache entry".to_string(),
    })
}

fn decode_entry(payload: &[u8]) -> Result<CacheEntry> {
    // Try to decompress (if it fails, assume it wasn't compressed)
    let json = match zstd::decode_all(payload) {
        Ok(decompressed) => decompressed,
        Err(_) => payload.to_vec(),
    };

    serde_json::from_slice(&json).map_err(|e| DocCacheError::Json {
        source: e,
        context: "Failed to parse cache entry".to_string(),
    })
}
