//! Search analytics, recorded off the request path
//!
//! Events go through a bounded channel to a single worker task that applies
//! them to `stats:*` keys. A full channel drops the event with a warning and
//! store failures inside the worker are logged and swallowed, so recording
//! can never fail or delay a search.

use crate::config::AnalyticsConfig;
use crate::error::Result;
use crate::storage::{KvStore, StoreClient};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const TOTAL_SEARCHES: &str = "stats:total_searches";
const CACHE_HITS: &str = "stats:cache_hits";
const TOTAL_DOCUMENTS: &str = "stats:total_documents";
const VECTORS_CREATED: &str = "stats:vectors_created";
const VECTORS_DELETED: &str = "stats:vectors_deleted";
const RESPONSE_TIMES: &str = "stats:response_times";
const POPULAR_QUERIES: &str = "stats:popular_queries";
const RECENT_SEARCHES: &str = "stats:recent_searches";
const HOURLY_PREFIX: &str = "stats:hourly:";

/// Suggestions are drawn from this many top queries
const SUGGESTION_POOL: usize = 10;
const MAX_SUGGESTIONS: usize = 5;

/// Something worth counting
#[derive(Debug, Clone)]
pub enum SearchEvent {
    Completed {
        query: String,
        cached: bool,
        results: usize,
        latency: Duration,
        at: DateTime<Utc>,
    },
    DocumentIndexed {
        doc_id: String,
        vectors_created: usize,
        vectors_deleted: usize,
        new_document: bool,
        at: DateTime<Utc>,
    },
    DocumentRemoved {
        doc_id: String,
        vectors_deleted: usize,
        at: DateTime<Utc>,
    },
    /// Every stored vector was deleted
    IndexReset {
        vectors_deleted: usize,
        at: DateTime<Utc>,
    },
}

enum Message {
    Event(SearchEvent),
    Flush(oneshot::Sender<()>),
}

/// One entry of the recent-search history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRecord {
    pub query: String,
    pub cached: bool,
    pub results: usize,
    /// Seconds
    pub latency: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
}

impl LatencySummary {
    fn from_samples(mut samples: Vec<f64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_by(f64::total_cmp);

        let n = samples.len();
        let median = if n % 2 == 0 {
            (samples[n / 2 - 1] + samples[n / 2]) / 2.0
        } else {
            samples[n / 2]
        };

        Self {
            samples: n,
            avg: samples.iter().sum::<f64>() / n as f64,
            min: samples[0],
            max: samples[n - 1],
            median,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopularQuery {
    pub query: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSnapshot {
    pub total_searches: i64,
    pub cache_hits: i64,
    pub cache_misses: i64,
    /// Percentage of searches served from the cache
    pub cache_hit_rate: f64,
    pub latency: LatencySummary,
    pub popular_queries: Vec<PopularQuery>,
    pub total_documents: i64,
    pub vectors_created: i64,
    pub vectors_deleted: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyUsage {
    /// Start of the hour, `YYYY-MM-DDTHH:00:00Z`
    pub hour: String,
    pub searches: i64,
    pub uploads: i64,
}

pub struct AnalyticsRecorder {
    client: StoreClient,
    config: AnalyticsConfig,
    tx: Option<mpsc::Sender<Message>>,
    worker: Option<tokio::task::JoinHandle<()>>,
}

impl AnalyticsRecorder {
    /// Start the recorder. Must be called inside a tokio runtime when enabled.
    pub fn new(client: StoreClient, config: &AnalyticsConfig) -> Self {
        if !config.enabled {
            return Self {
                client,
                config: config.clone(),
                tx: None,
                worker: None,
            };
        }

        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let worker_client = client.clone();
        let worker_config = config.clone();
        let worker = tokio::spawn(async move {
            analytics_worker(rx, worker_client, worker_config).await;
        });

        Self {
            client,
            config: config.clone(),
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue an event without waiting
    pub fn record(&self, event: SearchEvent) {
        let Some(tx) = &self.tx else {
            return;
        };

        match tx.try_send(Message::Event(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Analytics channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("Analytics worker stopped, dropping event");
            }
        }
    }

    /// Wait until every event queued so far has been applied
    pub async fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(Message::Flush(ack_tx)).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }

    /// Stop the worker after it drains pending events
    pub async fn shutdown(mut self) {
        drop(self.tx.take());

        if let Some(handle) = self.worker.take() {
            tracing::debug!("Waiting for analytics worker to drain...");
            let _ = handle.await;
        }
    }

    pub async fn snapshot(&self) -> Result<AnalyticsSnapshot> {
        let popular_limit = self.config.popular_limit;
        let latency_window = self.config.latency_window;

        self.client
            .call("analytics_snapshot", move |store| {
                let total_searches = read_counter(store, TOTAL_SEARCHES)?;
                let cache_hits = read_counter(store, CACHE_HITS)?;
                let cache_misses = (total_searches - cache_hits).max(0);
                let cache_hit_rate = if total_searches > 0 {
                    cache_hits as f64 / total_searches as f64 * 100.0
                } else {
                    0.0
                };

                let samples = store
                    .lrange(RESPONSE_TIMES, latency_window)?
                    .iter()
                    .filter_map(|raw| std::str::from_utf8(raw).ok()?.parse::<f64>().ok())
                    .collect();

                let popular_queries = store
                    .zrevrange(POPULAR_QUERIES, popular_limit)?
                    .into_iter()
                    .map(|(query, score)| PopularQuery {
                        query,
                        count: score.max(0.0) as u64,
                    })
                    .collect();

                Ok(AnalyticsSnapshot {
                    total_searches,
                    cache_hits,
                    cache_misses,
                    cache_hit_rate,
                    latency: LatencySummary::from_samples(samples),
                    popular_queries,
                    total_documents: read_counter(store, TOTAL_DOCUMENTS)?,
                    vectors_created: read_counter(store, VECTORS_CREATED)?,
                    vectors_deleted: read_counter(store, VECTORS_DELETED)?,
                })
            })
            .await
    }

    /// Popular queries starting with `prefix`, case-insensitively
    pub async fn suggestions(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.trim().to_lowercase();
        if prefix.is_empty() {
            return Ok(Vec::new());
        }

        let popular = self
            .client
            .call("analytics_suggestions", |store| {
                store.zrevrange(POPULAR_QUERIES, SUGGESTION_POOL)
            })
            .await?;

        Ok(popular
            .into_iter()
            .map(|(query, _)| query)
            .filter(|query| query.to_lowercase().starts_with(&prefix))
            .take(MAX_SUGGESTIONS)
            .collect())
    }

    /// Most recent searches, newest first
    pub async fn history(&self, limit: usize) -> Result<Vec<SearchRecord>> {
        let limit = limit.min(self.config.recent_window);
        let raw = self
            .client
            .call("analytics_history", move |store| {
                store.lrange(RECENT_SEARCHES, limit)
            })
            .await?;

        Ok(raw
            .iter()
            .filter_map(|entry| serde_json::from_slice(entry).ok())
            .collect())
    }

    /// Search and upload counts for the last `hours` hours, oldest first
    pub async fn hourly_usage(&self, hours: usize) -> Result<Vec<HourlyUsage>> {
        let now = Utc::now();
        let slots: Vec<DateTime<Utc>> = (0..hours as i64)
            .rev()
            .map(|ago| now - ChronoDuration::hours(ago))
            .collect();

        self.client
            .call("analytics_hourly", move |store| {
                slots
                    .iter()
                    .map(|slot| -> Result<HourlyUsage> {
                        let key = hourly_key(slot);
                        Ok(HourlyUsage {
                            hour: slot.format("%Y-%m-%dT%H:00:00Z").to_string(),
                            searches: read_counter(store, &format!("{}:searches", key))?,
                            uploads: read_counter(store, &format!("{}:uploads", key))?,
                        })
                    })
                    .collect()
            })
            .await
    }

    /// Clear search statistics.
    ///
    /// Document and vector counters describe what is stored, not searches,
    /// and are kept.
    pub async fn reset(&self) -> Result<()> {
        self.flush().await;

        self.client
            .call("analytics_reset", |store| {
                let keys: Vec<String> = [
                    TOTAL_SEARCHES,
                    CACHE_HITS,
                    RESPONSE_TIMES,
                    POPULAR_QUERIES,
                    RECENT_SEARCHES,
                ]
                .iter()
                .map(|k| k.to_string())
                .collect();
                store.del(&keys)?;
                store.del_prefix(HOURLY_PREFIX)?;
                Ok(())
            })
            .await?;

        tracing::info!("Analytics reset");
        Ok(())
    }
}

async fn analytics_worker(
    mut rx: mpsc::Receiver<Message>,
    client: StoreClient,
    config: AnalyticsConfig,
) {
    let mut applied = 0u64;
    let mut failed = 0u64;

    while let Some(message) = rx.recv().await {
        match message {
            Message::Event(event) => {
                let config = config.clone();
                match client
                    .call("analytics_apply", move |store| {
                        apply_event(store, &event, &config)
                    })
                    .await
                {
                    Ok(()) => applied += 1,
                    Err(e) => {
                        failed += 1;
                        tracing::warn!("Failed to record analytics event: {}", e);
                    }
                }
            }
            Message::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }

    tracing::debug!(
        "Analytics worker finished: {} events applied, {} failed",
        applied,
        failed
    );
}

fn apply_event(store: &dyn KvStore, event: &SearchEvent, config: &AnalyticsConfig) -> Result<()> {
    match event {
        SearchEvent::Completed {
            query,
            cached,
            results,
            latency,
            at,
        } => {
            store.incr_by(TOTAL_SEARCHES, 1)?;
            store.incr_by(&format!("{}:searches", hourly_key(at)), 1)?;

            if *cached {
                store.incr_by(CACHE_HITS, 1)?;
            } else {
                let secs = latency.as_secs_f64().to_string();
                store.lpush_capped(RESPONSE_TIMES, secs.as_bytes(), config.latency_window)?;
                store.zincr_by(POPULAR_QUERIES, query.trim(), 1.0)?;
            }

            let record = SearchRecord {
                query: query.clone(),
                cached: *cached,
                results: *results,
                latency: latency.as_secs_f64(),
                at: *at,
            };
            if let Ok(json) = serde_json::to_vec(&record) {
                store.lpush_capped(RECENT_SEARCHES, &json, config.recent_window)?;
            }
        }
        SearchEvent::DocumentIndexed {
            doc_id,
            vectors_created,
            vectors_deleted,
            new_document,
            at,
        } => {
            tracing::trace!("Recording index of {}", doc_id);
            if *new_document {
                store.incr_by(TOTAL_DOCUMENTS, 1)?;
            }
            store.incr_by(VECTORS_CREATED, *vectors_created as i64)?;
            if *vectors_deleted > 0 {
                store.incr_by(VECTORS_DELETED, *vectors_deleted as i64)?;
            }
            store.incr_by(&format!("{}:uploads", hourly_key(at)), 1)?;
        }
        SearchEvent::DocumentRemoved {
            doc_id,
            vectors_deleted,
            at: _,
        } => {
            tracing::trace!("Recording removal of {}", doc_id);
            if store.incr_by(TOTAL_DOCUMENTS, -1)? < 0 {
                store.set(TOTAL_DOCUMENTS, b"0", None)?;
            }
            store.incr_by(VECTORS_DELETED, *vectors_deleted as i64)?;
        }
        SearchEvent::IndexReset {
            vectors_deleted,
            at: _,
        } => {
            store.set(TOTAL_DOCUMENTS, b"0", None)?;
            store.incr_by(VECTORS_DELETED, *vectors_deleted as i64)?;
        }
    }
    Ok(())
}

fn hourly_key(at: &DateTime<Utc>) -> String {
    format!("{}{}", HOURLY_PREFIX, at.format("%Y%m%d%H"))
}

fn read_counter(store: &dyn KvStore, key: &str) -> Result<i64> {
    Ok(store
        .get(key)?
        .and_then(|raw| std::str::from_utf8(&raw).ok()?.trim().parse().ok())
        .unwrap_or(0))
}
