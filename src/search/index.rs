//! Named vector index over the record keyspace
//!
//! The engine indexes every hash under the record prefix, so writers never
//! register records here. Lack of engine support is a normal degraded mode:
//! the index reports itself unavailable and searches take the scan path.

use super::SearchFilters;
use crate::config::Config;
use crate::error::{DocCacheError, Result};
use crate::storage::{
    DistanceMetric, FieldKind, IndexDescription, IndexSchema, KnnHit, KnnQuery, StoreClient,
};
use crate::vector::{VectorCodec, VECTOR_FIELD};
use serde::Serialize;
use std::sync::RwLock;

/// Readiness as last determined by `ensure_ready`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum IndexState {
    Unknown,
    Ready,
    Unavailable(String),
}

/// Admin view of the index
#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub name: String,
    pub prefix: String,
    pub dimension: usize,
    pub api_version: u32,
    pub state: IndexState,
    pub engine: Option<IndexDescription>,
}

pub struct SearchIndex {
    client: StoreClient,
    codec: VectorCodec,
    schema: IndexSchema,
    state: RwLock<IndexState>,
}

impl SearchIndex {
    pub fn new(client: StoreClient, schema: IndexSchema) -> Self {
        Self {
            client,
            codec: VectorCodec::new(schema.dimension),
            schema,
            state: RwLock::new(IndexState::Unknown),
        }
    }

    pub fn from_config(client: StoreClient, config: &Config) -> Self {
        Self::new(client, document_schema(config))
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    pub fn state(&self) -> IndexState {
        self.state
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn set_state(&self, state: IndexState) {
        match self.state.write() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == IndexState::Ready
    }

    /// Create the index if the engine supports it and it does not exist yet.
    ///
    /// Returns whether the index is usable. Missing engine support or an
    /// engine speaking another query API version is not an error; store
    /// failures are.
    pub async fn ensure_ready(&self) -> Result<bool> {
        let engine_version = self
            .client
            .call("vector_index_api_version", |store| {
                Ok(store.vector_index_api_version())
            })
            .await?;

        let Some(engine_version) = engine_version else {
            let reason = format!("{} backend has no vector index engine", self.client.backend_name());
            tracing::info!("Vector index '{}' unavailable: {}", self.schema.name, reason);
            self.set_state(IndexState::Unavailable(reason));
            return Ok(false);
        };

        if engine_version != self.schema.api_version {
            let reason = format!(
                "engine query API version {} does not match pinned version {}",
                engine_version, self.schema.api_version
            );
            tracing::warn!("Vector index '{}' unavailable: {}", self.schema.name, reason);
            self.set_state(IndexState::Unavailable(reason));
            return Ok(false);
        }

        let schema = self.schema.clone();
        let created = self
            .client
            .call("create_vector_index", move |store| {
                if store.vector_index_exists(&schema.name)? {
                    return Ok(false);
                }
                store.create_vector_index(&schema).map(|_| true)
            })
            .await;

        match created {
            Ok(created) => {
                if created {
                    tracing::info!(
                        "Vector index '{}' created over '{}' ({}D, cosine)",
                        self.schema.name,
                        self.schema.prefix,
                        self.schema.dimension
                    );
                }
                self.set_state(IndexState::Ready);
                Ok(true)
            }
            Err(DocCacheError::IndexUnavailable(reason)) => {
                tracing::info!("Vector index '{}' unavailable: {}", self.schema.name, reason);
                self.set_state(IndexState::Unavailable(reason));
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Indexed nearest-neighbor query.
    ///
    /// Any engine-side failure comes back as `IndexQueryFailed` (or `Timeout`)
    /// so the caller can fall back for this call only; readiness is untouched.
    pub async fn knn_search(
        &self,
        query_vector: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<KnnHit>> {
        if !self.is_ready() {
            return Err(DocCacheError::IndexUnavailable(format!(
                "index '{}' is not ready",
                self.schema.name
            )));
        }

        let query = KnnQuery {
            vector: self.codec.encode(query_vector)?,
            k,
            filter: filters.to_knn_filter(),
            api_version: self.schema.api_version,
        };
        let name = self.schema.name.clone();

        match self
            .client
            .call("knn_query", move |store| store.knn_query(&name, &query))
            .await
        {
            Ok(hits) => Ok(hits),
            Err(e @ DocCacheError::Timeout { .. }) => Err(e),
            Err(e @ DocCacheError::IndexQueryFailed { .. }) => Err(e),
            Err(e) => Err(DocCacheError::IndexQueryFailed {
                index: self.schema.name.clone(),
                message: e.to_string(),
            }),
        }
    }

    pub async fn status(&self) -> Result<IndexStatus> {
        let name = self.schema.name.clone();
        let engine = self
            .client
            .call("vector_index_info", move |store| store.vector_index_info(&name))
            .await?;

        Ok(IndexStatus {
            name: self.schema.name.clone(),
            prefix: self.schema.prefix.clone(),
            dimension: self.schema.dimension,
            api_version: self.schema.api_version,
            state: self.state(),
            engine,
        })
    }

    /// Drop the engine-side index; records are left alone
    pub async fn drop_index(&self) -> Result<bool> {
        let name = self.schema.name.clone();
        let dropped = self
            .client
            .call("drop_vector_index", move |store| store.drop_vector_index(&name))
            .await?;
        self.set_state(IndexState::Unknown);
        Ok(dropped)
    }
}

/// Schema for document chunk records
pub fn document_schema(config: &Config) -> IndexSchema {
    IndexSchema {
        name: config.index.name.clone(),
        prefix: config.index.prefix.clone(),
        vector_field: VECTOR_FIELD.to_string(),
        dimension: config.embedding.dimension,
        metric: DistanceMetric::Cosine,
        fields: vec![
            ("content".to_string(), FieldKind::Text),
            ("title".to_string(), FieldKind::Text),
            ("filename".to_string(), FieldKind::Tag),
            ("doc_id".to_string(), FieldKind::Tag),
            ("chunk_id".to_string(), FieldKind::Tag),
            ("tags".to_string(), FieldKind::Tag),
            ("word_count".to_string(), FieldKind::Numeric),
            ("chunk_index".to_string(), FieldKind::Numeric),
            ("upload_date".to_string(), FieldKind::Text),
        ],
        api_version: config.index.api_version,
    }
}
