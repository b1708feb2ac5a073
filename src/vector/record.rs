//! Chunk input and persisted vector record types

use super::codec::VectorCodec;
use crate::error::{DocCacheError, Result};
use crate::storage::HashFields;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Hash field holding the encoded vector
pub const VECTOR_FIELD: &str = "vector";

const TAG_SEPARATOR: char = '|';

/// A unit of searchable text handed over by the ingestion side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(default = "new_chunk_id", alias = "id")]
    pub chunk_id: String,
    pub doc_id: String,
    pub text: String,
    #[serde(default)]
    pub chunk_index: u32,
    #[serde(default)]
    pub word_count: u32,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default = "Utc::now", alias = "created_at")]
    pub upload_date: DateTime<Utc>,
}

fn new_chunk_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Chunk {
    pub fn new(doc_id: impl Into<String>, chunk_index: u32, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            chunk_id: new_chunk_id(),
            doc_id: doc_id.into(),
            word_count: text.split_whitespace().count() as u32,
            text,
            chunk_index,
            tags: BTreeSet::new(),
            title: String::new(),
            filename: String::new(),
            upload_date: Utc::now(),
        }
    }

    pub fn with_chunk_id(mut self, chunk_id: impl Into<String>) -> Self {
        self.chunk_id = chunk_id.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn with_upload_date(mut self, upload_date: DateTime<Utc>) -> Self {
        self.upload_date = upload_date;
        self
    }
}

/// Embedding of one chunk plus its provenance
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkEmbedding {
    pub vector: Vec<f32>,
    pub method: String,
    pub model: String,
}

impl ChunkEmbedding {
    pub fn new(vector: Vec<f32>, method: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            vector,
            method: method.into(),
            model: model.into(),
        }
    }
}

/// Everything stored beside the vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub chunk_id: String,
    pub doc_id: String,
    pub content: String,
    pub chunk_index: u32,
    pub word_count: u32,
    pub tags: BTreeSet<String>,
    pub title: String,
    pub filename: String,
    pub upload_date: Option<DateTime<Utc>>,
    pub embedding_method: String,
    pub embedding_model: String,
}

impl RecordMeta {
    pub fn to_fields(&self) -> HashFields {
        let tags = self
            .tags
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("|");

        let mut fields = HashFields::new();
        let mut put = |name: &str, value: String| {
            fields.insert(name.to_string(), value.into_bytes());
        };
        put("chunk_id", self.chunk_id.clone());
        put("doc_id", self.doc_id.clone());
        put("content", self.content.clone());
        put("chunk_index", self.chunk_index.to_string());
        put("word_count", self.word_count.to_string());
        put("tags", tags);
        put("title", self.title.clone());
        put("filename", self.filename.clone());
        if let Some(date) = self.upload_date {
            put("upload_date", date.to_rfc3339());
        }
        put("embedding_method", self.embedding_method.clone());
        put("embedding_model", self.embedding_model.clone());
        fields
    }

    /// Rebuild from stored fields; `doc_id` is the only mandatory one
    pub fn from_fields(key: &str, prefix: &str, fields: &HashFields) -> Result<Self> {
        let text = |name: &str| {
            fields
                .get(name)
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default()
        };
        let number = |name: &str| text(name).trim().parse::<u32>().unwrap_or(0);

        let doc_id = text("doc_id");
        if doc_id.is_empty() {
            return Err(DocCacheError::CorruptRecord {
                key: key.to_string(),
                reason: "missing doc_id".to_string(),
            });
        }

        let chunk_id = match text("chunk_id") {
            id if id.is_empty() => key.strip_prefix(prefix).unwrap_or(key).to_string(),
            id => id,
        };

        Ok(Self {
            chunk_id,
            doc_id,
            content: text("content"),
            chunk_index: number("chunk_index"),
            word_count: number("word_count"),
            tags: split_tags(&text("tags")),
            title: text("title"),
            filename: text("filename"),
            upload_date: parse_timestamp(&text("upload_date")),
            embedding_method: text("embedding_method"),
            embedding_model: text("embedding_model"),
        })
    }
}

/// Persisted form of one chunk's embedding
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub meta: RecordMeta,
    pub vector: Vec<f32>,
}

impl VectorRecord {
    /// Build the record for a chunk, keeping at most `content_max_chars` of its text
    pub fn from_chunk(chunk: &Chunk, embedding: ChunkEmbedding, content_max_chars: usize) -> Self {
        Self {
            meta: RecordMeta {
                chunk_id: chunk.chunk_id.clone(),
                doc_id: chunk.doc_id.clone(),
                content: truncate_chars(&chunk.text, content_max_chars).to_string(),
                chunk_index: chunk.chunk_index,
                word_count: chunk.word_count,
                tags: chunk.tags.clone(),
                title: chunk.title.clone(),
                filename: chunk.filename.clone(),
                upload_date: Some(chunk.upload_date),
                embedding_method: embedding.method,
                embedding_model: embedding.model,
            },
            vector: embedding.vector,
        }
    }

    pub fn chunk_id(&self) -> &str {
        &self.meta.chunk_id
    }

    pub fn to_fields(&self, codec: &VectorCodec) -> Result<HashFields> {
        let mut fields = self.meta.to_fields();
        fields.insert(VECTOR_FIELD.to_string(), codec.encode(&self.vector)?);
        Ok(fields)
    }

    pub fn from_fields(
        key: &str,
        prefix: &str,
        fields: &HashFields,
        codec: &VectorCodec,
    ) -> Result<Self> {
        let bytes = fields
            .get(VECTOR_FIELD)
            .ok_or_else(|| DocCacheError::CorruptVector("missing vector field".to_string()))?;
        let vector = codec.decode(bytes)?;
        let meta = RecordMeta::from_fields(key, prefix, fields)?;
        Ok(Self { meta, vector })
    }
}

pub fn record_key(prefix: &str, chunk_id: &str) -> String {
    format!("{}{}", prefix, chunk_id)
}

pub fn split_tags(joined: &str) -> BTreeSet<String> {
    joined
        .split(TAG_SEPARATOR)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Accepts RFC 3339 and zone-less ISO 8601 (taken as UTC)
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

/// Longest prefix of at most `max_chars` characters
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding() -> ChunkEmbedding {
        ChunkEmbedding::new(vec![0.5, 0.5], "hash", "blake3-2")
    }

    #[test]
    fn test_chunk_counts_words() {
        let chunk = Chunk::new("doc-1", 0, "machine  learning\nbasics");
        assert_eq!(chunk.word_count, 3);
        assert!(!chunk.chunk_id.is_empty());
    }

    #[test]
    fn test_fields_round_trip() {
        let codec = VectorCodec::new(2);
        let chunk = Chunk::new("doc-1", 3, "some text")
            .with_chunk_id("c-1")
            .with_tags(["ml", "intro"])
            .with_title("Basics")
            .with_filename("basics.pdf");

        let record = VectorRecord::from_chunk(&chunk, embedding(), 1000);
        let fields = record.to_fields(&codec).unwrap();
        assert_eq!(fields["tags"], b"intro|ml".to_vec());
        assert_eq!(fields[VECTOR_FIELD].len(), 8);

        let restored = VectorRecord::from_fields("vector:c-1", "vector:", &fields, &codec).unwrap();
        assert_eq!(restored.meta.chunk_index, 3);
        assert_eq!(restored.meta.tags, chunk.tags);
        assert_eq!(restored.vector, vec![0.5, 0.5]);
        assert_eq!(
            restored.meta.upload_date.map(|d| d.timestamp()),
            Some(chunk.upload_date.timestamp())
        );
    }

    #[test]
    fn test_missing_doc_id_is_corrupt_record() {
        let mut fields = HashFields::new();
        fields.insert("content".to_string(), b"x".to_vec());
        assert!(matches!(
            RecordMeta::from_fields("vector:x", "vector:", &fields),
            Err(DocCacheError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn test_chunk_id_falls_back_to_key() {
        let mut fields = HashFields::new();
        fields.insert("doc_id".to_string(), b"d".to_vec());
        let meta = RecordMeta::from_fields("vector:abc", "vector:", &fields).unwrap();
        assert_eq!(meta.chunk_id, "abc");
    }

    #[test]
    fn test_content_truncated_on_char_boundary() {
        let chunk = Chunk::new("doc-1", 0, "héllo wörld");
        let record = VectorRecord::from_chunk(&chunk, embedding(), 4);
        assert_eq!(record.meta.content, "héll");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn test_parse_timestamp_variants() {
        assert!(parse_timestamp("2024-05-01T10:00:00Z").is_some());
        assert!(parse_timestamp("2024-05-01T10:00:00.123456").is_some());
        assert!(parse_timestamp("yesterday").is_none());
        assert!(parse_timestamp("").is_none());
    }
}
