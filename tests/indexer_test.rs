//! Pipeline tests: bootstrap, polling, crash resume, timestamp validation

mod common;

use bson::doc;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use common::{index_config, test_config, MemorySource};
use open_atlas_search::indexer::{init_timestamp_fields, IndexerService};
use open_atlas_search::search::{SearchEngine, SearchRequest};

fn fixture_source() -> Arc<MemorySource> {
    let source = MemorySource::new();
    let base = Utc::now() - ChronoDuration::seconds(60);
    for (id, title, offset) in [("a", "red fox", 0), ("b", "blue whale", 1), ("c", "red panda", 2)] {
        source.insert(
            "docs",
            doc! {
                "_id": id,
                "title": title,
                "updated_at": bson::DateTime::from_chrono(base + ChronoDuration::seconds(offset)),
            },
        );
    }
    source
}

async fn wait_until<F, Fut>(mut check: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn search_request(index: &str, query: serde_json::Value) -> SearchRequest {
    SearchRequest {
        index: index.to_string(),
        query,
        facets: None,
        highlight: None,
        size: 100,
        from: 0,
    }
}

#[tokio::test]
async fn test_initial_indexing_ingests_existing_documents() {
    let dir = TempDir::new().unwrap();
    let source = fixture_source();
    let config = Arc::new(test_config(dir.path(), vec![index_config("test", "docs", 1)]));
    let engine = Arc::new(SearchEngine::new(&config.search).unwrap());

    let indexer = Arc::new(
        IndexerService::new(source.clone(), engine.clone(), config.clone())
            .await
            .unwrap(),
    );
    indexer.clone().start().await;

    let ready = wait_until(
        || {
            let engine = engine.clone();
            async move { engine.doc_count("test").await.unwrap_or(0) == 3 }
        },
        Duration::from_secs(10),
    )
    .await;
    assert!(ready, "initial indexing did not complete");

    let response = engine
        .search(&search_request("test", json!({"text": {"query": "red", "path": "title"}})))
        .await
        .unwrap();
    assert_eq!(response.total, 2);
    let mut ids: Vec<_> = response.hits.iter().map(|h| h.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "c"]);

    // The collection state reports a completed pass
    let states = indexer.sync_states();
    let state = &states["app.docs"];
    assert_eq!(state.progress, "100%");
    assert!(state.last_sync_time.is_some());

    indexer.stop().await;
}

#[tokio::test]
async fn test_poller_picks_up_new_documents() {
    let dir = TempDir::new().unwrap();
    let source = fixture_source();
    let config = Arc::new(test_config(dir.path(), vec![index_config("test", "docs", 1)]));
    let engine = Arc::new(SearchEngine::new(&config.search).unwrap());

    let indexer = Arc::new(
        IndexerService::new(source.clone(), engine.clone(), config.clone())
            .await
            .unwrap(),
    );
    indexer.clone().start().await;

    wait_until(
        || {
            let engine = engine.clone();
            async move { engine.doc_count("test").await.unwrap_or(0) == 3 }
        },
        Duration::from_secs(10),
    )
    .await;

    // A document newer than everything the poller has observed
    source.insert(
        "docs",
        doc! {
            "_id": "d",
            "title": "red deer",
            "updated_at": bson::DateTime::from_chrono(Utc::now() + ChronoDuration::seconds(1)),
        },
    );

    let picked_up = wait_until(
        || {
            let engine = engine.clone();
            async move { engine.doc_count("test").await.unwrap_or(0) == 4 }
        },
        Duration::from_secs(10),
    )
    .await;
    assert!(picked_up, "poller did not ingest the new document");

    let response = engine
        .search(&search_request("test", json!({"text": {"query": "red", "path": "title"}})))
        .await
        .unwrap();
    assert_eq!(response.total, 3);
    assert!(response.hits.iter().any(|h| h.id == "d"));

    indexer.stop().await;
}

#[tokio::test]
async fn test_restart_resumes_from_persisted_state() {
    let dir = TempDir::new().unwrap();
    let source = fixture_source();
    let config = Arc::new(test_config(dir.path(), vec![index_config("test", "docs", 1)]));

    let (last_poll_before, count_before) = {
        let engine = Arc::new(SearchEngine::new(&config.search).unwrap());
        let indexer = Arc::new(
            IndexerService::new(source.clone(), engine.clone(), config.clone())
                .await
                .unwrap(),
        );
        indexer.clone().start().await;

        wait_until(
            || {
                let engine = engine.clone();
                async move { engine.doc_count("test").await.unwrap_or(0) == 3 }
            },
            Duration::from_secs(10),
        )
        .await;

        // Let at least one poll tick publish its state
        wait_until(
            || {
                let indexer = indexer.clone();
                async move {
                    indexer
                        .sync_states()
                        .get("app.docs")
                        .and_then(|s| s.last_sync_time)
                        .is_some()
                }
            },
            Duration::from_secs(10),
        )
        .await;

        let state = indexer.sync_states()["app.docs"].clone();
        indexer.stop().await;
        engine.close().await.unwrap();

        (state.last_poll_time.unwrap(), 3u64)
    };

    // New process: same directories, fresh engine and service
    let engine = Arc::new(SearchEngine::new(&config.search).unwrap());
    let indexer = Arc::new(
        IndexerService::new(source.clone(), engine.clone(), config.clone())
            .await
            .unwrap(),
    );

    let restored = indexer.sync_states()["app.docs"].clone();
    assert_eq!(
        restored.last_poll_time.unwrap().timestamp_millis(),
        last_poll_before.timestamp_millis()
    );

    // The reopened shards immediately hold at least the pre-crash corpus
    assert!(engine.doc_count("test").await.unwrap() >= count_before);

    indexer.stop().await;
}

#[tokio::test]
async fn test_missing_timestamp_field_fails_fast() {
    let dir = TempDir::new().unwrap();
    let source = MemorySource::new();
    source.insert("docs", doc! { "_id": "a", "title": "no timestamp here" });

    let config = Arc::new(test_config(dir.path(), vec![index_config("test", "docs", 1)]));
    let engine = Arc::new(SearchEngine::new(&config.search).unwrap());

    let result = IndexerService::new(source, engine, config).await;
    let err = result.err().expect("service must refuse to start");
    assert!(err.to_string().contains("init-timestamps"));
}

#[tokio::test]
async fn test_init_timestamps_backfills_missing_field() {
    let dir = TempDir::new().unwrap();
    let source = MemorySource::new();
    source.insert("docs", doc! { "_id": "a", "title": "one" });
    source.insert("docs", doc! { "_id": "b", "title": "two" });

    let config = Arc::new(test_config(dir.path(), vec![index_config("test", "docs", 1)]));

    let updated = init_timestamp_fields(source.as_ref(), &config).await.unwrap();
    assert_eq!(updated, 2);

    // The service starts cleanly once the field exists
    let engine = Arc::new(SearchEngine::new(&config.search).unwrap());
    let indexer = IndexerService::new(source, engine, config).await;
    assert!(indexer.is_ok());
    indexer.unwrap().stop().await;
}

#[tokio::test]
async fn test_intrinsic_id_ordering() {
    let dir = TempDir::new().unwrap();
    let source = MemorySource::new();
    source.insert("docs", doc! { "_id": bson::oid::ObjectId::new(), "title": "red fox" });

    let mut index = index_config("test", "docs", 1);
    index.timestamp_field = "_id".to_string();
    let config = Arc::new(test_config(dir.path(), vec![index]));
    let engine = Arc::new(SearchEngine::new(&config.search).unwrap());

    let indexer = Arc::new(
        IndexerService::new(source.clone(), engine.clone(), config.clone())
            .await
            .unwrap(),
    );
    indexer.clone().start().await;

    let ready = wait_until(
        || {
            let engine = engine.clone();
            async move { engine.doc_count("test").await.unwrap_or(0) == 1 }
        },
        Duration::from_secs(10),
    )
    .await;
    assert!(ready);

    indexer.stop().await;
}
