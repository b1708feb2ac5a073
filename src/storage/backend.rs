//! Key-value/hash store abstraction
//!
//! The search core only relies on primitives that are individually atomic:
//! no operation here spans keys transactionally except `hset_many`, which
//! backends may implement as one transaction but callers must not depend on.

use crate::error::{DocCacheError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Field map of a hash record
pub type HashFields = BTreeMap<String, Vec<u8>>;

/// One page of a prefix scan
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub keys: Vec<String>,
    /// Resume point for the next page, `None` once the keyspace is exhausted
    pub cursor: Option<String>,
}

/// Distance metric declared for a vector field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMetric {
    Cosine,
}

/// Kind of a non-vector indexed field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Text,
    Tag,
    Numeric,
}

/// Declared schema of a named vector index over a key prefix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub prefix: String,
    pub vector_field: String,
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub fields: Vec<(String, FieldKind)>,
    /// Query API version the caller builds its queries against
    pub api_version: u32,
}

/// Pre-filter evaluated by the index engine
#[derive(Debug, Clone, Default)]
pub struct KnnFilter {
    /// Match any of these `doc_id` values (empty = no restriction)
    pub doc_ids: Vec<String>,
    /// Require all of these tags (empty = no restriction)
    pub tags: Vec<String>,
    /// Case-insensitive exact `filename`
    pub filename: Option<String>,
    /// Inclusive `upload_date` bounds; records without a date fail either bound
    pub uploaded_from: Option<DateTime<Utc>>,
    pub uploaded_to: Option<DateTime<Utc>>,
}

/// A k-nearest-neighbor query against a named index
#[derive(Debug, Clone)]
pub struct KnnQuery {
    /// Query vector in the index's declared float32 layout
    pub vector: Vec<u8>,
    pub k: usize,
    pub filter: KnnFilter,
    pub api_version: u32,
}

/// One engine-reported neighbor
#[derive(Debug, Clone)]
pub struct KnnHit {
    pub key: String,
    /// Engine-native distance (cosine distance, `1 - cos`)
    pub distance: f32,
    /// Stored fields, vector field excluded
    pub fields: HashFields,
}

/// Engine-reported index description
#[derive(Debug, Clone, Serialize)]
pub struct IndexDescription {
    pub name: String,
    pub prefix: String,
    pub dimension: usize,
    pub num_docs: usize,
}

/// A Redis-like key-value store.
///
/// Implementations are synchronous; async callers go through
/// [`StoreClient`](super::StoreClient), which adds deadlines.
pub trait KvStore: Send + Sync {
    /// Short backend identifier used in errors and logs
    fn backend_name(&self) -> &'static str;

    /// Check that the store is reachable
    fn ping(&self) -> Result<()>;

    /// Replace a hash record wholesale
    fn hset(&self, key: &str, fields: &HashFields) -> Result<()>;

    /// Replace several hash records
    fn hset_many(&self, records: &[(String, HashFields)]) -> Result<()> {
        for (key, fields) in records {
            self.hset(key, fields)?;
        }
        Ok(())
    }

    fn hgetall(&self, key: &str) -> Result<Option<HashFields>>;

    fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;

    /// Read one field from each key, in key order
    fn hget_many(&self, keys: &[String], field: &str) -> Result<Vec<Option<Vec<u8>>>> {
        keys.iter().map(|key| self.hget(key, field)).collect()
    }

    /// Read a page of hash records under a prefix
    fn scan_hashes(
        &self,
        prefix: &str,
        after: Option<&str>,
        count: usize,
    ) -> Result<(Vec<(String, HashFields)>, Option<String>)> {
        let page = self.scan_prefix(prefix, after, count)?;
        let mut records = Vec::with_capacity(page.keys.len());
        for key in page.keys {
            // Keys deleted between the scan and the read are simply absent
            if let Some(fields) = self.hgetall(&key)? {
                records.push((key, fields));
            }
        }
        Ok((records, page.cursor))
    }

    /// Delete keys of any type, returning how many existed
    fn del(&self, keys: &[String]) -> Result<usize>;

    /// Delete every key under a prefix
    fn del_prefix(&self, prefix: &str) -> Result<usize>;

    /// Keys under a prefix in ascending order, strictly after `after`
    fn scan_prefix(&self, prefix: &str, after: Option<&str>, count: usize) -> Result<ScanPage>;

    fn count_prefix(&self, prefix: &str) -> Result<usize>;

    /// String value, `None` if missing or expired
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Atomically add to an integer counter, returning the new value
    fn incr_by(&self, key: &str, amount: i64) -> Result<i64>;

    /// Push to the head of a list and trim it to `cap` entries
    fn lpush_capped(&self, key: &str, value: &[u8], cap: usize) -> Result<usize>;

    /// Up to `limit` list entries, newest first
    fn lrange(&self, key: &str, limit: usize) -> Result<Vec<Vec<u8>>>;

    /// Atomically add to a sorted-set member's score
    fn zincr_by(&self, key: &str, member: &str, amount: f64) -> Result<f64>;

    /// Up to `limit` members by descending score
    fn zrevrange(&self, key: &str, limit: usize) -> Result<Vec<(String, f64)>>;

    /// Query API version of the vector index engine, `None` without one
    fn vector_index_api_version(&self) -> Option<u32> {
        None
    }

    fn create_vector_index(&self, schema: &IndexSchema) -> Result<()> {
        Err(DocCacheError::IndexUnavailable(format!(
            "{} backend has no vector index support (index '{}')",
            self.backend_name(),
            schema.name
        )))
    }

    fn vector_index_info(&self, _name: &str) -> Result<Option<IndexDescription>> {
        Ok(None)
    }

    fn vector_index_exists(&self, name: &str) -> Result<bool> {
        Ok(self.vector_index_info(name)?.is_some())
    }

    fn drop_vector_index(&self, _name: &str) -> Result<bool> {
        Ok(false)
    }

    fn knn_query(&self, name: &str, _query: &KnnQuery) -> Result<Vec<KnnHit>> {
        Err(DocCacheError::IndexUnavailable(format!(
            "{} backend has no vector index support (index '{}')",
            self.backend_name(),
            name
        )))
    }
}
