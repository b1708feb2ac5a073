#![allow(dead_code)]

use docucache::config::Config;
use docucache::embedding::{EmbeddingError, EmbeddingProvider};
use docucache::error::{DocCacheError, Result};
use docucache::storage::{
    HashFields, IndexDescription, IndexSchema, KnnHit, KnnQuery, KvStore, MemoryStore, ScanPage,
    SqliteStore,
};
use docucache::search::CACHE_PREFIX;
use docucache::vector::Chunk;
use docucache::DocumentCache;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const DIM: usize = 8;

const AXES: [&str; DIM] = [
    "machine",
    "learning",
    "python",
    "syntax",
    "database",
    "schema",
    "algorithms",
    "design",
];

/// One axis per known keyword; unknown words are ignored
pub struct KeywordProvider;

impl EmbeddingProvider for KeywordProvider {
    fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
        let mut vector = vec![0.0; DIM];
        for word in text.split_whitespace() {
            let word = word.to_lowercase();
            if let Some(axis) = AXES.iter().position(|a| *a == word) {
                vector[axis] += 1.0;
            }
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        DIM
    }

    fn model_name(&self) -> &str {
        "keyword-axes"
    }

    fn method(&self) -> &str {
        "keyword"
    }
}

/// Provider that is always down
pub struct DownProvider;

impl EmbeddingProvider for DownProvider {
    fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::GenerationError("model server unreachable".to_string()))
    }

    fn dimension(&self) -> usize {
        DIM
    }

    fn model_name(&self) -> &str {
        "down"
    }

    fn method(&self) -> &str {
        "down"
    }
}

/// Memory store with injectable faults
pub struct FaultyStore {
    inner: MemoryStore,
    fail_knn: bool,
    scan_delay: Option<Duration>,
    cache_write_delay: Option<Duration>,
}

impl FaultyStore {
    /// Index engine present, but every KNN query fails
    pub fn failing_knn() -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_knn: true,
            scan_delay: None,
            cache_write_delay: None,
        }
    }

    /// Prefix scans stall for `delay`
    pub fn slow_scans(delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new().with_vector_index(false),
            fail_knn: false,
            scan_delay: Some(delay),
            cache_write_delay: None,
        }
    }

    /// Writes of cached search results stall for `delay` before landing
    pub fn slow_cache_writes(delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_knn: false,
            scan_delay: None,
            cache_write_delay: Some(delay),
        }
    }
}

impl KvStore for FaultyStore {
    fn backend_name(&self) -> &'static str {
        "faulty"
    }

    fn ping(&self) -> Result<()> {
        self.inner.ping()
    }

    fn hset(&self, key: &str, fields: &HashFields) -> Result<()> {
        self.inner.hset(key, fields)
    }

    fn hgetall(&self, key: &str) -> Result<Option<HashFields>> {
        self.inner.hgetall(key)
    }

    fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        self.inner.hget(key, field)
    }

    fn del(&self, keys: &[String]) -> Result<usize> {
        self.inner.del(keys)
    }

    fn del_prefix(&self, prefix: &str) -> Result<usize> {
        self.inner.del_prefix(prefix)
    }

    fn scan_prefix(&self, prefix: &str, after: Option<&str>, count: usize) -> Result<ScanPage> {
        if let Some(delay) = self.scan_delay {
            std::thread::sleep(delay);
        }
        self.inner.scan_prefix(prefix, after, count)
    }

    fn count_prefix(&self, prefix: &str) -> Result<usize> {
        self.inner.count_prefix(prefix)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        if let Some(delay) = self.cache_write_delay {
            if key.starts_with(CACHE_PREFIX) {
                std::thread::sleep(delay);
            }
        }
        self.inner.set(key, value, ttl)
    }

    fn incr_by(&self, key: &str, amount: i64) -> Result<i64> {
        self.inner.incr_by(key, amount)
    }

    fn lpush_capped(&self, key: &str, value: &[u8], cap: usize) -> Result<usize> {
        self.inner.lpush_capped(key, value, cap)
    }

    fn lrange(&self, key: &str, limit: usize) -> Result<Vec<Vec<u8>>> {
        self.inner.lrange(key, limit)
    }

    fn zincr_by(&self, key: &str, member: &str, amount: f64) -> Result<f64> {
        self.inner.zincr_by(key, member, amount)
    }

    fn zrevrange(&self, key: &str, limit: usize) -> Result<Vec<(String, f64)>> {
        self.inner.zrevrange(key, limit)
    }

    fn vector_index_api_version(&self) -> Option<u32> {
        self.inner.vector_index_api_version()
    }

    fn create_vector_index(&self, schema: &IndexSchema) -> Result<()> {
        self.inner.create_vector_index(schema)
    }

    fn vector_index_info(&self, name: &str) -> Result<Option<IndexDescription>> {
        self.inner.vector_index_info(name)
    }

    fn drop_vector_index(&self, name: &str) -> Result<bool> {
        self.inner.drop_vector_index(name)
    }

    fn knn_query(&self, name: &str, query: &KnnQuery) -> Result<Vec<KnnHit>> {
        if self.fail_knn {
            return Err(DocCacheError::IndexQueryFailed {
                index: name.to_string(),
                message: "syntax error near KNN".to_string(),
            });
        }
        self.inner.knn_query(name, query)
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.storage.backend = "memory".to_string();
    config.embedding.provider = "hash".to_string();
    config.embedding.dimension = DIM;
    config.search.scan_batch_size = 4;
    config.timeouts.store_ms = 2000;
    config
}

/// A named backend plus whatever must outlive it
pub struct Backend {
    pub name: &'static str,
    pub store: Arc<dyn KvStore>,
    _dir: Option<TempDir>,
}

/// Every backend the search core must behave identically on
pub fn backends() -> Vec<Backend> {
    let dir = TempDir::new().unwrap();
    let sqlite = SqliteStore::open(&dir.path().join("test.sqlite"), 4, 5000).unwrap();

    vec![
        Backend {
            name: "memory+index",
            store: Arc::new(MemoryStore::new()),
            _dir: None,
        },
        Backend {
            name: "memory",
            store: Arc::new(MemoryStore::new().with_vector_index(false)),
            _dir: None,
        },
        Backend {
            name: "sqlite",
            store: Arc::new(sqlite),
            _dir: Some(dir),
        },
    ]
}

pub async fn open(store: Arc<dyn KvStore>) -> DocumentCache {
    open_with(test_config(), store).await
}

pub async fn open_with(config: Config, store: Arc<dyn KvStore>) -> DocumentCache {
    DocumentCache::with_store(config, store, Arc::new(KeywordProvider))
        .await
        .unwrap()
}

/// Index a single-chunk document through the keyword provider
pub async fn index_text(service: &DocumentCache, doc_id: &str, text: &str) -> Chunk {
    let chunk = Chunk::new(doc_id, 0, text).with_chunk_id(format!("{}-0", doc_id));
    service
        .embed_and_index(doc_id, std::slice::from_ref(&chunk))
        .await
        .unwrap();
    chunk
}

pub async fn seed_three(service: &DocumentCache) {
    index_text(service, "ml", "machine learning basics").await;
    index_text(service, "py", "python syntax guide").await;
    index_text(service, "db", "database schema design").await;
}
