//! In-memory key-value store with a FLAT vector index engine
//!
//! Explicit demo backend selected by configuration. Indexes cover every hash
//! whose key starts with the declared prefix, so records written before or
//! after `create_vector_index` are searchable without registration.

use super::backend::{
    HashFields, IndexDescription, IndexSchema, KnnFilter, KnnHit, KnnQuery, KvStore, ScanPage,
};
use crate::error::{DocCacheError, Result};
use crate::vector::cosine_similarity;
use crate::vector::record::parse_timestamp;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// Query API version implemented by the FLAT engine
pub const MEMORY_INDEX_API_VERSION: u32 = 1;

enum Entry {
    Hash(HashFields),
    Str {
        value: Vec<u8>,
        expires_at: Option<Instant>,
    },
    List(VecDeque<Vec<u8>>),
    ZSet(HashMap<String, f64>),
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self, Entry::Str { expires_at: Some(at), .. } if *at <= now)
    }
}

#[derive(Default)]
struct Keyspace {
    entries: BTreeMap<String, Entry>,
    indexes: HashMap<String, IndexSchema>,
}

/// Process-local store
pub struct MemoryStore {
    inner: RwLock<Keyspace>,
    vector_index: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Keyspace::default()),
            vector_index: true,
        }
    }

    /// Enable or disable the vector index engine
    pub fn with_vector_index(mut self, enabled: bool) -> Self {
        self.vector_index = enabled;
        self
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Keyspace>> {
        self.inner
            .read()
            .map_err(|_| DocCacheError::store("memory", "keyspace lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Keyspace>> {
        self.inner
            .write()
            .map_err(|_| DocCacheError::store("memory", "keyspace lock poisoned"))
    }
}

fn wrong_type(key: &str) -> DocCacheError {
    DocCacheError::store(
        "memory",
        format!("WRONGTYPE operation against key '{}' holding the wrong kind of value", key),
    )
}

/// Read a float32 little-endian vector, `None` unless exactly `dimension` finite values
fn read_f32_vector(bytes: &[u8], dimension: usize) -> Option<Vec<f32>> {
    if bytes.len() != dimension * 4 {
        return None;
    }
    let vector: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    vector.iter().all(|v| v.is_finite()).then_some(vector)
}

fn matches_filter(fields: &HashFields, filter: &KnnFilter) -> bool {
    if !filter.doc_ids.is_empty() {
        let doc_id = fields.get("doc_id").map(|v| String::from_utf8_lossy(v));
        match doc_id {
            Some(doc_id) if filter.doc_ids.iter().any(|d| *d == doc_id) => {}
            _ => return false,
        }
    }

    if !filter.tags.is_empty() {
        let tags = fields
            .get("tags")
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_default();
        let present: Vec<&str> = tags.split('|').filter(|t| !t.is_empty()).collect();
        if !filter.tags.iter().all(|t| present.contains(&t.as_str())) {
            return false;
        }
    }

    if let Some(wanted) = &filter.filename {
        let filename = fields
            .get("filename")
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_default();
        if !filename.eq_ignore_ascii_case(wanted) {
            return false;
        }
    }

    if filter.uploaded_from.is_some() || filter.uploaded_to.is_some() {
        let uploaded = fields
            .get("upload_date")
            .and_then(|v| parse_timestamp(&String::from_utf8_lossy(v)));
        let Some(uploaded) = uploaded else {
            return false;
        };
        if filter.uploaded_from.is_some_and(|from| uploaded < from) {
            return false;
        }
        if filter.uploaded_to.is_some_and(|to| uploaded > to) {
            return false;
        }
    }

    true
}

impl KvStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn ping(&self) -> Result<()> {
        self.read().map(|_| ())
    }

    fn hset(&self, key: &str, fields: &HashFields) -> Result<()> {
        let mut inner = self.write()?;
        inner
            .entries
            .insert(key.to_string(), Entry::Hash(fields.clone()));
        Ok(())
    }

    fn hset_many(&self, records: &[(String, HashFields)]) -> Result<()> {
        let mut inner = self.write()?;
        for (key, fields) in records {
            inner.entries.insert(key.clone(), Entry::Hash(fields.clone()));
        }
        Ok(())
    }

    fn hgetall(&self, key: &str) -> Result<Option<HashFields>> {
        let inner = self.read()?;
        match inner.entries.get(key) {
            Some(Entry::Hash(fields)) => Ok(Some(fields.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let inner = self.read()?;
        match inner.entries.get(key) {
            Some(Entry::Hash(fields)) => Ok(fields.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    fn del(&self, keys: &[String]) -> Result<usize> {
        let mut inner = self.write()?;
        Ok(keys
            .iter()
            .filter(|key| inner.entries.remove(key.as_str()).is_some())
            .count())
    }

    fn del_prefix(&self, prefix: &str) -> Result<usize> {
        let mut inner = self.write()?;
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - inner.entries.len())
    }

    fn scan_prefix(&self, prefix: &str, after: Option<&str>, count: usize) -> Result<ScanPage> {
        let inner = self.read()?;
        let now = Instant::now();

        let start = match after {
            Some(after) if after >= prefix => std::ops::Bound::Excluded(after.to_string()),
            _ => std::ops::Bound::Included(prefix.to_string()),
        };

        let mut keys: Vec<String> = inner
            .entries
            .range((start, std::ops::Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .take(count + 1)
            .collect();

        let cursor = if keys.len() > count {
            keys.truncate(count);
            keys.last().cloned()
        } else {
            None
        };

        Ok(ScanPage { keys, cursor })
    }

    fn count_prefix(&self, prefix: &str) -> Result<usize> {
        let inner = self.read()?;
        let now = Instant::now();
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, entry)| !entry.is_expired(now))
            .count())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        {
            let inner = self.read()?;
            match inner.entries.get(key) {
                Some(entry) if entry.is_expired(now) => {}
                Some(Entry::Str { value, .. }) => return Ok(Some(value.clone())),
                Some(_) => return Err(wrong_type(key)),
                None => return Ok(None),
            }
        }

        let mut inner = self.write()?;
        if inner.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            inner.entries.remove(key);
        }
        Ok(None)
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut inner = self.write()?;
        inner.entries.insert(
            key.to_string(),
            Entry::Str {
                value: value.to_vec(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    fn incr_by(&self, key: &str, amount: i64) -> Result<i64> {
        let mut inner = self.write()?;
        let now = Instant::now();
        let current = match inner.entries.get(key) {
            Some(entry) if entry.is_expired(now) => 0,
            Some(Entry::Str { value, .. }) => std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.trim().parse::<i64>().ok())
                .ok_or_else(|| {
                    DocCacheError::store("memory", format!("value at '{}' is not an integer", key))
                })?,
            Some(_) => return Err(wrong_type(key)),
            None => 0,
        };

        let next = current + amount;
        inner.entries.insert(
            key.to_string(),
            Entry::Str {
                value: next.to_string().into_bytes(),
                expires_at: None,
            },
        );
        Ok(next)
    }

    fn lpush_capped(&self, key: &str, value: &[u8], cap: usize) -> Result<usize> {
        let mut inner = self.write()?;
        let entry = inner
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::List(VecDeque::new()));
        match entry {
            Entry::List(list) => {
                list.push_front(value.to_vec());
                list.truncate(cap);
                Ok(list.len())
            }
            _ => Err(wrong_type(key)),
        }
    }

    fn lrange(&self, key: &str, limit: usize) -> Result<Vec<Vec<u8>>> {
        let inner = self.read()?;
        match inner.entries.get(key) {
            Some(Entry::List(list)) => Ok(list.iter().take(limit).cloned().collect()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    fn zincr_by(&self, key: &str, member: &str, amount: f64) -> Result<f64> {
        let mut inner = self.write()?;
        let entry = inner
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::ZSet(HashMap::new()));
        match entry {
            Entry::ZSet(members) => {
                let score = members.entry(member.to_string()).or_insert(0.0);
                *score += amount;
                Ok(*score)
            }
            _ => Err(wrong_type(key)),
        }
    }

    fn zrevrange(&self, key: &str, limit: usize) -> Result<Vec<(String, f64)>> {
        let inner = self.read()?;
        match inner.entries.get(key) {
            Some(Entry::ZSet(members)) => {
                let mut ranked: Vec<(String, f64)> =
                    members.iter().map(|(m, s)| (m.clone(), *s)).collect();
                ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                ranked.truncate(limit);
                Ok(ranked)
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    fn vector_index_api_version(&self) -> Option<u32> {
        self.vector_index.then_some(MEMORY_INDEX_API_VERSION)
    }

    fn create_vector_index(&self, schema: &IndexSchema) -> Result<()> {
        if !self.vector_index {
            return Err(DocCacheError::IndexUnavailable(format!(
                "memory backend started without vector index support (index '{}')",
                schema.name
            )));
        }

        let mut inner = self.write()?;
        if !inner.indexes.contains_key(&schema.name) {
            tracing::debug!(
                "Created FLAT index '{}' over prefix '{}' (dim {})",
                schema.name,
                schema.prefix,
                schema.dimension
            );
            inner.indexes.insert(schema.name.clone(), schema.clone());
        }
        Ok(())
    }

    fn vector_index_info(&self, name: &str) -> Result<Option<IndexDescription>> {
        let inner = self.read()?;
        let Some(schema) = inner.indexes.get(name) else {
            return Ok(None);
        };

        let num_docs = inner
            .entries
            .range(schema.prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&schema.prefix))
            .filter(|(_, entry)| match entry {
                Entry::Hash(fields) => fields
                    .get(&schema.vector_field)
                    .is_some_and(|v| v.len() == schema.dimension * 4),
                _ => false,
            })
            .count();

        Ok(Some(IndexDescription {
            name: schema.name.clone(),
            prefix: schema.prefix.clone(),
            dimension: schema.dimension,
            num_docs,
        }))
    }

    fn drop_vector_index(&self, name: &str) -> Result<bool> {
        let mut inner = self.write()?;
        Ok(inner.indexes.remove(name).is_some())
    }

    fn knn_query(&self, name: &str, query: &KnnQuery) -> Result<Vec<KnnHit>> {
        let inner = self.read()?;
        let schema = inner
            .indexes
            .get(name)
            .ok_or_else(|| DocCacheError::IndexQueryFailed {
                index: name.to_string(),
                message: "Unknown index name".to_string(),
            })?;

        if query.api_version != MEMORY_INDEX_API_VERSION {
            return Err(DocCacheError::IndexQueryFailed {
                index: name.to_string(),
                message: format!(
                    "query built for API version {}, engine speaks {}",
                    query.api_version, MEMORY_INDEX_API_VERSION
                ),
            });
        }

        let query_vector = read_f32_vector(&query.vector, schema.dimension).ok_or_else(|| {
            DocCacheError::IndexQueryFailed {
                index: name.to_string(),
                message: format!(
                    "query vector is {} bytes, expected {}",
                    query.vector.len(),
                    schema.dimension * 4
                ),
            }
        })?;

        let mut hits: Vec<(f32, &String, &HashFields)> = inner
            .entries
            .range(schema.prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&schema.prefix))
            .filter_map(|(key, entry)| match entry {
                Entry::Hash(fields) => Some((key, fields)),
                _ => None,
            })
            .filter(|(_, fields)| matches_filter(fields, &query.filter))
            .filter_map(|(key, fields)| {
                let stored = read_f32_vector(fields.get(&schema.vector_field)?, schema.dimension)?;
                let distance = 1.0 - cosine_similarity(&query_vector, &stored);
                Some((distance, key, fields))
            })
            .collect();

        hits.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)));
        hits.truncate(query.k);

        Ok(hits
            .into_iter()
            .map(|(distance, key, fields)| {
                let mut fields = fields.clone();
                fields.remove(&schema.vector_field);
                KnnHit {
                    key: key.clone(),
                    distance,
                    fields,
                }
            })
            .collect())
    }
}
