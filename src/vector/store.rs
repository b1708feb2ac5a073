//! Keyed store of vector records
//!
//! Records live under `<prefix><chunk_id>` as hashes. Writes for one document
//! go out in a single batch, but nothing here is atomic across keys: a reader
//! may observe a document with only part of its chunks present.

use super::codec::VectorCodec;
use super::record::{record_key, VectorRecord};
use crate::error::Result;
use crate::storage::{HashFields, StoreClient};
use serde::Serialize;
use std::collections::VecDeque;

/// Outcome of a batch upsert
#[derive(Debug, Clone, Default)]
pub struct UpsertReport {
    pub written: usize,
    pub failures: Vec<RecordFailure>,
}

/// A record left out of a batch
#[derive(Debug, Clone, Serialize)]
pub struct RecordFailure {
    pub chunk_id: String,
    pub reason: String,
}

/// Outcome of deleting a document's records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub deleted: usize,
    /// Records whose owning document could not be read; left in place
    pub unreadable: usize,
}

/// Outcome of removing unreadable records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub removed: usize,
    pub kept: usize,
}

/// Vector record store over the shared keyspace
#[derive(Clone)]
pub struct VectorStore {
    client: StoreClient,
    codec: VectorCodec,
    prefix: String,
    scan_batch: usize,
}

impl VectorStore {
    pub fn new(
        client: StoreClient,
        codec: VectorCodec,
        prefix: impl Into<String>,
        scan_batch: usize,
    ) -> Self {
        Self {
            client,
            codec,
            prefix: prefix.into(),
            scan_batch: scan_batch.max(1),
        }
    }

    pub fn codec(&self) -> &VectorCodec {
        &self.codec
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn client(&self) -> &StoreClient {
        &self.client
    }

    /// Write all records of a document in one store call.
    ///
    /// Records that fail to encode or name another document are skipped and
    /// reported; they never abort the rest of the batch.
    pub async fn upsert_batch(&self, doc_id: &str, records: &[VectorRecord]) -> Result<UpsertReport> {
        let mut report = UpsertReport::default();
        let mut prepared: Vec<(String, HashFields)> = Vec::with_capacity(records.len());

        for record in records {
            if record.meta.doc_id != doc_id {
                tracing::warn!(
                    "Skipping chunk {}: belongs to document {}, not {}",
                    record.chunk_id(),
                    record.meta.doc_id,
                    doc_id
                );
                report.failures.push(RecordFailure {
                    chunk_id: record.chunk_id().to_string(),
                    reason: format!("record belongs to document {}", record.meta.doc_id),
                });
                continue;
            }

            match record.to_fields(&self.codec) {
                Ok(fields) => prepared.push((record_key(&self.prefix, record.chunk_id()), fields)),
                Err(e) => {
                    tracing::warn!("Skipping chunk {} of {}: {}", record.chunk_id(), doc_id, e);
                    report.failures.push(RecordFailure {
                        chunk_id: record.chunk_id().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if prepared.is_empty() {
            return Ok(report);
        }

        report.written = prepared.len();
        self.client
            .call("hset_many", move |store| store.hset_many(&prepared))
            .await?;

        tracing::debug!(
            "Upserted {} vectors for {} ({} skipped)",
            report.written,
            doc_id,
            report.failures.len()
        );
        Ok(report)
    }

    /// Remove every record of a document
    pub async fn delete_by_doc(&self, doc_id: &str) -> Result<DeleteReport> {
        let (chunk_ids, unreadable) = self.doc_chunk_ids(doc_id).await?;
        let deleted = self.delete_chunks(&chunk_ids).await?;
        Ok(DeleteReport {
            deleted,
            unreadable,
        })
    }

    /// Delete records by chunk id, returning how many existed
    pub async fn delete_chunks(&self, chunk_ids: &[String]) -> Result<usize> {
        if chunk_ids.is_empty() {
            return Ok(0);
        }
        let keys: Vec<String> = chunk_ids
            .iter()
            .map(|chunk_id| record_key(&self.prefix, chunk_id))
            .collect();
        self.client.call("del", move |store| store.del(&keys)).await
    }

    /// Chunk ids stored for `doc_id`, plus how many records had no readable owner
    pub async fn doc_chunk_ids(&self, doc_id: &str) -> Result<(Vec<String>, usize)> {
        let mut owned = Vec::new();
        let mut unreadable = 0;
        let mut cursor: Option<String> = None;

        loop {
            let prefix = self.prefix.clone();
            let batch = self.scan_batch;
            let after = cursor.take();
            let (page, owners) = self
                .client
                .call("scan_doc_ids", move |store| {
                    let page = store.scan_prefix(&prefix, after.as_deref(), batch)?;
                    let owners = store.hget_many(&page.keys, "doc_id")?;
                    Ok((page, owners))
                })
                .await?;

            for (key, owner) in page.keys.into_iter().zip(owners) {
                match owner.and_then(|bytes| String::from_utf8(bytes).ok()) {
                    Some(owner) if owner == doc_id => {
                        let chunk_id = key.strip_prefix(self.prefix.as_str()).unwrap_or(&key);
                        owned.push(chunk_id.to_string());
                    }
                    Some(owner) if !owner.is_empty() => {}
                    _ => {
                        tracing::warn!("Record {} has no readable doc_id, leaving it in place", key);
                        unreadable += 1;
                    }
                }
            }

            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
            tokio::task::yield_now().await;
        }

        Ok((owned, unreadable))
    }

    /// Delete every record that no longer decodes, keeping the rest
    pub async fn purge_corrupt(&self) -> Result<PurgeReport> {
        let mut report = PurgeReport::default();
        let mut cursor: Option<String> = None;

        loop {
            let prefix = self.prefix.clone();
            let batch = self.scan_batch;
            let codec = self.codec;
            let after = cursor.take();
            let (corrupt, readable, next) = self
                .client
                .call("scan_corrupt", move |store| {
                    let (raw, next) = store.scan_hashes(&prefix, after.as_deref(), batch)?;
                    let mut corrupt = Vec::new();
                    let mut readable = 0;
                    for (key, fields) in raw {
                        match VectorRecord::from_fields(&key, &prefix, &fields, &codec) {
                            Ok(_) => readable += 1,
                            Err(e) => corrupt.push((key, e.to_string())),
                        }
                    }
                    Ok((corrupt, readable, next))
                })
                .await?;

            report.kept += readable;
            if !corrupt.is_empty() {
                for (key, reason) in &corrupt {
                    tracing::warn!("Removing unreadable vector record {}: {}", key, reason);
                }
                let keys: Vec<String> = corrupt.into_iter().map(|(key, _)| key).collect();
                report.removed += self.client.call("del", move |store| store.del(&keys)).await?;
            }

            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
            tokio::task::yield_now().await;
        }

        tracing::info!(
            "Vector cleanup: {} unreadable records removed, {} kept",
            report.removed,
            report.kept
        );
        Ok(report)
    }

    /// Number of stored records
    pub async fn count(&self) -> Result<usize> {
        let prefix = self.prefix.clone();
        self.client
            .call("count_prefix", move |store| store.count_prefix(&prefix))
            .await
    }

    pub async fn get(&self, chunk_id: &str) -> Result<Option<VectorRecord>> {
        let key = record_key(&self.prefix, chunk_id);
        let lookup = key.clone();
        let fields = self
            .client
            .call("hgetall", move |store| store.hgetall(&lookup))
            .await?;

        fields
            .map(|fields| VectorRecord::from_fields(&key, &self.prefix, &fields, &self.codec))
            .transpose()
    }

    /// Delete every record under the prefix
    pub async fn delete_all(&self) -> Result<usize> {
        let prefix = self.prefix.clone();
        self.client
            .call("del_prefix", move |store| store.del_prefix(&prefix))
            .await
    }

    /// Lazily walk every record, skipping unreadable ones
    pub fn scan_all(&self) -> RecordScan {
        RecordScan {
            store: self.clone(),
            cursor: None,
            exhausted: false,
            buffer: VecDeque::new(),
            scanned: 0,
            skipped: 0,
        }
    }
}

/// Batched, cursor-driven walk over stored records.
///
/// Each store round trip reads at most one batch; the task yields between
/// batches so long scans share the runtime.
pub struct RecordScan {
    store: VectorStore,
    cursor: Option<String>,
    exhausted: bool,
    buffer: VecDeque<VectorRecord>,
    scanned: usize,
    skipped: usize,
}

impl RecordScan {
    /// Next batch of decodable records, `None` once the keyspace is exhausted
    pub async fn next_batch(&mut self) -> Result<Option<Vec<VectorRecord>>> {
        if !self.buffer.is_empty() {
            return Ok(Some(self.buffer.drain(..).collect()));
        }

        while !self.exhausted {
            let prefix = self.store.prefix.clone();
            let batch = self.store.scan_batch;
            let codec = self.store.codec;
            let after = self.cursor.take();

            let (decoded, cursor) = self
                .store
                .client
                .call("scan_hashes", move |store| {
                    let (raw, cursor) = store.scan_hashes(&prefix, after.as_deref(), batch)?;
                    let decoded: Vec<(String, Result<VectorRecord>)> = raw
                        .into_iter()
                        .map(|(key, fields)| {
                            let record = VectorRecord::from_fields(&key, &prefix, &fields, &codec);
                            (key, record)
                        })
                        .collect();
                    Ok((decoded, cursor))
                })
                .await?;

            self.exhausted = cursor.is_none();
            self.cursor = cursor;

            let mut records = Vec::with_capacity(decoded.len());
            for (key, record) in decoded {
                self.scanned += 1;
                match record {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        self.skipped += 1;
                        tracing::warn!("Skipping unreadable vector record {}: {}", key, e);
                    }
                }
            }

            if !self.exhausted {
                tokio::task::yield_now().await;
            }
            if !records.is_empty() {
                return Ok(Some(records));
            }
        }

        Ok(None)
    }

    /// Next decodable record
    pub async fn next(&mut self) -> Result<Option<VectorRecord>> {
        if self.buffer.is_empty() {
            match self.next_batch().await? {
                Some(batch) => self.buffer.extend(batch),
                None => return Ok(None),
            }
        }
        Ok(self.buffer.pop_front())
    }

    /// Drain the rest of the scan into memory
    pub async fn collect_all(mut self) -> Result<(Vec<VectorRecord>, usize)> {
        let mut records = Vec::new();
        while let Some(batch) = self.next_batch().await? {
            records.extend(batch);
        }
        Ok((records, self.skipped))
    }

    /// Records read so far, readable or not
    pub fn scanned(&self) -> usize {
        self.scanned
    }

    /// Records skipped so far as unreadable
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("backend", &self.client.backend_name())
            .field("prefix", &self.prefix)
            .field("dimension", &self.codec.dimension())
            .finish()
    }
}
