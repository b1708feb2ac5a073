mod common;

use common::*;
use docucache::error::DocCacheError;
use docucache::search::{SearchFilters, SearchQuery, CACHE_PREFIX};
use docucache::storage::{HashFields, KvStore, MemoryStore, StoreClient};
use docucache::vector::{Chunk, ChunkEmbedding};
use std::sync::Arc;
use std::time::Duration;

fn ids(response: &docucache::SearchResponse) -> Vec<String> {
    response.results.iter().map(|h| h.doc_id.clone()).collect()
}

#[tokio::test]
async fn test_three_document_scenario() {
    for backend in backends() {
        let service = open(backend.store).await;
        seed_three(&service).await;

        let query = SearchQuery::new("learning algorithms")
            .with_limit(3)
            .with_threshold(0.0);
        let response = service.search(&query).await.unwrap();

        assert_eq!(response.total_results, 3, "backend {}", backend.name);
        assert_eq!(response.results[0].doc_id, "ml", "backend {}", backend.name);
        assert!((response.results[0].similarity_score - 0.5).abs() < 1e-5);
        for pair in response.results.windows(2) {
            assert!(pair[0].similarity_score >= pair[1].similarity_score);
        }
        assert!(!response.cached);
    }
}

#[tokio::test]
async fn test_second_identical_query_is_cached() {
    for backend in backends() {
        let service = open(backend.store).await;
        seed_three(&service).await;

        let query = SearchQuery::new("python syntax").with_threshold(0.0).with_limit(3);
        let first = service.search(&query).await.unwrap();
        let second = service.search(&query).await.unwrap();

        assert!(!first.cached, "backend {}", backend.name);
        assert!(second.cached, "backend {}", backend.name);
        assert_eq!(first.results, second.results);

        // A different limit is a different request
        let other = service.search(&query.clone().with_limit(2)).await.unwrap();
        assert!(!other.cached);
    }
}

#[tokio::test]
async fn test_ranking_is_deterministic() {
    for backend in backends() {
        let mut config = test_config();
        config.cache.enabled = false;
        let service = open_with(config, backend.store).await;
        seed_three(&service).await;
        index_text(&service, "ml2", "machine learning design").await;

        let query = SearchQuery::new("machine design").with_threshold(0.0);
        let a = service.search(&query).await.unwrap();
        let b = service.search(&query).await.unwrap();
        assert!(!b.cached);
        assert_eq!(a.results, b.results, "backend {}", backend.name);
    }
}

#[tokio::test]
async fn test_raising_threshold_never_adds_results() {
    for backend in backends() {
        let service = open(backend.store).await;
        seed_three(&service).await;
        index_text(&service, "mix", "machine learning database").await;

        let mut previous = usize::MAX;
        for threshold in [0.0, 0.2, 0.4, 0.6, 0.8, 1.0] {
            let query = SearchQuery::new("machine learning").with_threshold(threshold);
            let response = service.search(&query).await.unwrap();
            assert!(response.total_results <= previous, "backend {}", backend.name);
            assert!(response
                .results
                .iter()
                .all(|hit| hit.similarity_score >= threshold));
            previous = response.total_results;
        }
    }
}

#[tokio::test]
async fn test_index_and_scan_paths_agree() {
    let indexed = open(Arc::new(MemoryStore::new())).await;
    let scanned = open(Arc::new(MemoryStore::new().with_vector_index(false))).await;
    assert!(indexed.index().is_ready());
    assert!(!scanned.index().is_ready());

    for service in [&indexed, &scanned] {
        index_text(service, "a", "machine machine learning").await;
        index_text(service, "b", "machine python").await;
        index_text(service, "c", "database").await;
        index_text(service, "d", "machine learning learning algorithms").await;
    }

    let query = SearchQuery::new("machine learning").with_threshold(0.0).with_limit(4);
    let a = indexed.search(&query).await.unwrap();
    let b = scanned.search(&query).await.unwrap();

    assert_eq!(ids(&a), ids(&b));
    for (x, y) in a.results.iter().zip(&b.results) {
        assert!((x.similarity_score - y.similarity_score).abs() < 1e-5);
    }
}

#[tokio::test]
async fn test_failing_index_query_falls_back_to_scan() {
    let service = open(Arc::new(FaultyStore::failing_knn())).await;
    assert!(service.index().is_ready());
    seed_three(&service).await;

    let query = SearchQuery::new("database design").with_threshold(0.1);
    let response = service.search(&query).await.unwrap();
    assert_eq!(ids(&response), vec!["db"]);

    // The failure is per call; the index stays ready
    assert!(service.index().is_ready());
}

#[tokio::test]
async fn test_removed_document_never_comes_back() {
    for backend in backends() {
        let service = open(backend.store).await;
        seed_three(&service).await;

        let chunks: Vec<Chunk> = (0..3)
            .map(|i| Chunk::new("ml-long", i, "machine learning in depth"))
            .collect();
        service.embed_and_index("ml-long", &chunks).await.unwrap();

        let query = SearchQuery::new("machine learning").with_threshold(0.0);
        let before = service.search(&query).await.unwrap();
        assert!(ids(&before).iter().any(|d| d == "ml-long"));

        let count_before = service.vector_store().count().await.unwrap();
        let report = service.remove_document("ml-long").await.unwrap();
        assert_eq!(report.deleted, 3);
        assert_eq!(
            service.vector_store().count().await.unwrap(),
            count_before - 3,
            "backend {}",
            backend.name
        );

        let after = service.search(&query).await.unwrap();
        assert!(!after.cached, "write should invalidate cached results");
        assert!(ids(&after).iter().all(|d| d != "ml-long"), "backend {}", backend.name);

        // Removing again is a no-op
        assert_eq!(service.remove_document("ml-long").await.unwrap().deleted, 0);
    }
}

#[tokio::test]
async fn test_zero_vector_scores_zero() {
    for backend in backends() {
        let service = open(backend.store).await;
        let chunk = Chunk::new("blank", 0, "nothing known here").with_chunk_id("blank-0");
        let embedding = ChunkEmbedding::new(vec![0.0; DIM], "keyword", "keyword-axes");
        service
            .index_document("blank", &[chunk], vec![embedding])
            .await
            .unwrap();

        let query = SearchQuery::new("machine").with_threshold(0.0);
        let response = service.search(&query).await.unwrap();
        assert_eq!(response.total_results, 1, "backend {}", backend.name);
        let score = response.results[0].similarity_score;
        assert!(score.is_finite());
        assert_eq!(score, 0.0);

        // A query with no known words is a zero vector too
        let response = service
            .search(&SearchQuery::new("unrelated words").with_threshold(0.0))
            .await
            .unwrap();
        assert!(response.results.iter().all(|h| h.similarity_score == 0.0));
    }
}

#[tokio::test]
async fn test_wrong_dimension_is_never_stored() {
    for backend in backends() {
        let service = open(backend.store).await;
        let chunks = vec![
            Chunk::new("d", 0, "machine").with_chunk_id("d-0"),
            Chunk::new("d", 1, "python").with_chunk_id("d-1"),
        ];
        let embeddings = vec![
            ChunkEmbedding::new(vec![1.0; DIM], "keyword", "keyword-axes"),
            ChunkEmbedding::new(vec![1.0; DIM + 1], "keyword", "keyword-axes"),
        ];

        let report = service.index_document("d", &chunks, embeddings).await.unwrap();
        assert_eq!(report.vectors_stored, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].chunk_id, "d-1");
        assert!(service.vector_store().get("d-1").await.unwrap().is_none());
        assert_eq!(service.vector_store().count().await.unwrap(), 1);
    }
}

#[tokio::test]
async fn test_corrupt_record_is_skipped() {
    for backend in backends() {
        let store = Arc::clone(&backend.store);
        let service = open(backend.store).await;
        seed_three(&service).await;

        let mut fields = HashFields::new();
        fields.insert("doc_id".to_string(), b"broken".to_vec());
        fields.insert("chunk_id".to_string(), b"broken-0".to_vec());
        fields.insert("content".to_string(), b"machine learning".to_vec());
        fields.insert("vector".to_string(), vec![0xde, 0xad, 0xbe]);
        store.hset("vector:broken-0", &fields).unwrap();

        let query = SearchQuery::new("machine learning").with_threshold(0.0);
        let response = service.search(&query).await.unwrap();
        assert_eq!(response.total_results, 3, "backend {}", backend.name);
        assert!(ids(&response).iter().all(|d| d != "broken"));
    }
}

#[tokio::test]
async fn test_filters_and_response_shaping() {
    for backend in backends() {
        let service = open(backend.store).await;
        let chunks = vec![
            Chunk::new("tagged", 0, "machine learning")
                .with_chunk_id("tagged-0")
                .with_tags(["ml", "intro"])
                .with_filename("ml.pdf"),
            Chunk::new("tagged", 1, "machine learning algorithms")
                .with_chunk_id("tagged-1")
                .with_tags(["ml"])
                .with_filename("ml.pdf"),
        ];
        service.embed_and_index("tagged", &chunks).await.unwrap();
        index_text(&service, "plain", "machine learning").await;

        let filters = SearchFilters {
            tags: ["ml".to_string(), "intro".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let query = SearchQuery::new("machine learning")
            .with_threshold(0.0)
            .with_filters(filters)
            .with_content(false);
        let response = service.search(&query).await.unwrap();

        let chunk_ids: Vec<&str> = response.results.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(chunk_ids, vec!["tagged-0"], "backend {}", backend.name);
        assert!(response.results[0].content.is_none());
        assert_eq!(
            response.results[0].metadata.as_ref().unwrap().filename,
            "ml.pdf"
        );

        let by_file = SearchQuery::new("machine").with_threshold(0.0).with_filters(SearchFilters {
            filename: Some("ML.PDF".to_string()),
            ..Default::default()
        });
        assert_eq!(service.search(&by_file).await.unwrap().total_results, 2);
    }
}

#[tokio::test]
async fn test_embedding_outage_is_an_error_not_empty_results() {
    let service = docucache::DocumentCache::with_store(
        test_config(),
        Arc::new(MemoryStore::new()),
        Arc::new(DownProvider),
    )
    .await
    .unwrap();

    let result = service.search(&SearchQuery::new("anything")).await;
    assert!(matches!(result, Err(DocCacheError::EmbeddingUnavailable(_))));
}

#[tokio::test]
async fn test_slow_store_times_out() {
    let mut config = test_config();
    config.timeouts.store_ms = 50;
    let store = Arc::new(FaultyStore::slow_scans(Duration::from_millis(300)));
    let service = open_with(config, store).await;

    let result = service
        .search(&SearchQuery::new("machine").with_threshold(0.0))
        .await;
    match result {
        Err(e) => {
            assert!(e.is_timeout(), "unexpected error: {}", e);
            assert!(!matches!(e, DocCacheError::StoreUnavailable { .. }));
        }
        Ok(_) => panic!("search should time out"),
    }
}

#[tokio::test]
async fn test_timed_out_write_can_still_land() {
    let store: Arc<dyn KvStore> =
        Arc::new(FaultyStore::slow_cache_writes(Duration::from_millis(200)));
    let client = StoreClient::new(Arc::clone(&store), Duration::from_millis(20));
    let key = format!("{}late", CACHE_PREFIX);

    let write_key = key.clone();
    let result = client
        .call("cache_set", move |s| s.set(&write_key, b"payload", None))
        .await;
    assert!(result.expect_err("write should time out").is_timeout());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(store.get(&key).unwrap(), Some(b"payload".to_vec()));
}

#[tokio::test]
async fn test_removal_during_an_in_flight_search_is_not_cached() {
    let store = Arc::new(FaultyStore::slow_cache_writes(Duration::from_millis(400)));
    let service = open(store).await;
    seed_three(&service).await;
    let query = SearchQuery::new("database schema").with_threshold(0.0);

    // The removal lands while the first search is still writing its results
    let (first, removed) = tokio::join!(service.search(&query), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        service.remove_document("db").await
    });
    let first = first.expect("first search failed");
    assert!(first.results.iter().any(|hit| hit.doc_id == "db"));
    assert_eq!(removed.expect("removal failed").deleted, 1);

    let second = service.search(&query).await.unwrap();
    assert!(!second.cached);
    assert!(second.results.iter().all(|hit| hit.doc_id != "db"));
}

#[tokio::test]
async fn test_analytics_follow_searches() {
    let service = open(Arc::new(MemoryStore::new())).await;
    seed_three(&service).await;

    let query = SearchQuery::new("database schema").with_threshold(0.0);
    service.search(&query).await.unwrap();
    service.search(&query).await.unwrap();
    service.flush_analytics().await;

    let snapshot = service.analytics().snapshot().await.unwrap();
    assert_eq!(snapshot.total_searches, 2);
    assert_eq!(snapshot.cache_hits, 1);
    assert_eq!(snapshot.total_documents, 3);
    assert_eq!(snapshot.vectors_created, 3);
    assert_eq!(snapshot.popular_queries[0].query, "database schema");

    let stats = service.stats().await.unwrap();
    assert_eq!(stats.total_vectors, 3);
    assert!(stats.index_ready);

    assert_eq!(
        service.analytics().suggestions("data").await.unwrap(),
        vec!["database schema"]
    );
    service.shutdown().await;
}

#[tokio::test]
async fn test_clear_cache_reports_entries() {
    let service = open(Arc::new(MemoryStore::new())).await;
    seed_three(&service).await;

    for text in ["machine", "python", "database"] {
        service
            .search(&SearchQuery::new(text).with_threshold(0.0))
            .await
            .unwrap();
    }
    assert_eq!(service.clear_cache().await.unwrap(), 3);
    assert_eq!(service.clear_cache().await.unwrap(), 0);
}
