//! Storage layer for docucache
//!
//! One backing key-value store per process, selected by configuration and
//! shared by every component through a [`StoreClient`] handle.

pub mod backend;
pub mod database;
pub mod memory;

use crate::config::Config;
use crate::error::{DocCacheError, Result};
use std::sync::Arc;
use std::time::Duration;

pub use backend::{
    DistanceMetric, FieldKind, HashFields, IndexDescription, IndexSchema, KnnFilter, KnnHit,
    KnnQuery, KvStore, ScanPage,
};
pub use database::{DbPool, SqliteStore};
pub use memory::MemoryStore;

/// Async handle to the backing store.
///
/// Every call runs on the blocking pool under the configured deadline; a
/// deadline miss is reported as `Timeout`, never as `StoreUnavailable`.
#[derive(Clone)]
pub struct StoreClient {
    backend: Arc<dyn KvStore>,
    timeout: Duration,
}

impl StoreClient {
    pub fn new(backend: Arc<dyn KvStore>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The underlying synchronous store
    pub fn raw(&self) -> &Arc<dyn KvStore> {
        &self.backend
    }

    /// Run one store operation under the deadline.
    ///
    /// A `Timeout` only means the caller stopped waiting. The blocking task
    /// is not cancelled, so a write that timed out may still be applied.
    pub async fn call<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn KvStore) -> Result<T> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        let task = tokio::task::spawn_blocking(move || f(backend.as_ref()));

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(DocCacheError::store(
                self.backend.backend_name(),
                format!("{} task failed: {}", operation, join_error),
            )),
            Err(_) => {
                tracing::warn!(
                    "Store operation '{}' exceeded {}ms",
                    operation,
                    self.timeout.as_millis()
                );
                Err(DocCacheError::Timeout {
                    operation: operation.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    pub async fn ping(&self) -> Result<()> {
        self.call("ping", |store| store.ping()).await
    }
}

/// Build the backing store named by the configuration
pub fn open_store(config: &Config) -> Result<Arc<dyn KvStore>> {
    match config.storage.backend.as_str() {
        "sqlite" => {
            let store = SqliteStore::open(
                &config.db_path(),
                config.storage.pool_size,
                config.storage.busy_timeout_ms,
            )?;
            Ok(Arc::new(store))
        }
        "memory" => {
            tracing::info!(
                "Using in-memory store (vector index: {})",
                config.storage.memory_vector_index
            );
            Ok(Arc::new(
                MemoryStore::new().with_vector_index(config.storage.memory_vector_index),
            ))
        }
        other => Err(DocCacheError::InvalidConfigValue {
            path: "storage.backend".to_string(),
            message: format!("Unknown backend '{}'", other),
        }),
    }
}

/// Open the configured store and wrap it in a client
pub fn open_client(config: &Config) -> Result<StoreClient> {
    Ok(StoreClient::new(open_store(config)?, config.timeouts.store()))
}
