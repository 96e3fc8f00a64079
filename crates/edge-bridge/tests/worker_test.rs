//! Integration tests for the resource item worker.
//!
//! Each test drives a worker against a wiremock upstream and the in-memory
//! store, then checks what reached storage, the retry queue and the
//! counters.

mod common;

use std::time::Duration;

use anyhow::Result;
use common::{
    date, document_json, eventually, mount_document, mount_status, worker_config, Harness,
};
use edge_bridge::{
    retry::RetryPolicy,
    worker::{Iteration, WorkerConfig},
};
use edge_core::{ResourceDocument, ResourceItemReference, RetryMetadata};
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{method, path},
    Mock, ResponseTemplate,
};

#[tokio::test]
async fn fresh_item_is_fetched_and_saved() -> Result<()> {
    let harness =
        Harness::with(WorkerConfig { bulk_save_limit: 1, ..worker_config() }, RetryPolicy::default())
            .await;
    mount_document(&harness.server, "a", "2017-01-02T00:00:00Z").await;
    harness.enqueue(ResourceItemReference::new("a", date("2017-01-02T00:00:00Z"))).await;

    let token = CancellationToken::new();
    let handle = tokio::spawn(harness.worker(token.clone()).run());

    let storage = harness.storage.clone();
    let saved = eventually(Duration::from_secs(5), || {
        let storage = storage.clone();
        async move { storage.len().await == 1 }
    })
    .await;
    assert!(saved, "document should reach storage");

    token.cancel();
    handle.await??;

    let stored = harness.storage.document("a").await.expect("document stored");
    assert_eq!(stored.date_modified(), date("2017-01-02T00:00:00Z"));
    assert_eq!(stored.body()["_id"], "a");
    assert_eq!(stored.body()["doc_type"], "Tender");

    let stats = harness.stats().await;
    assert_eq!(stats.save_documents, 1);
    assert_eq!(stats.exceptions_count, 0);
    assert!(harness.retry_queue.is_empty());
    Ok(())
}

#[tokio::test]
async fn already_current_item_is_skipped_without_fetch() -> Result<()> {
    let harness = Harness::new().await;
    harness
        .storage
        .insert(ResourceDocument::from_value(document_json("a", "2017-01-02T00:00:00Z"))?)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/2.5/tenders/a"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&harness.server)
        .await;

    harness.enqueue(ResourceItemReference::new("a", date("2017-01-01T00:00:00Z"))).await;
    let mut worker = harness.worker(CancellationToken::new());

    assert_eq!(worker.run_once().await, Iteration::Processed);
    assert_eq!(worker.pending(), 0);
    assert_eq!(harness.stats().await.skipped, 1);
    Ok(())
}

#[tokio::test]
async fn unresolved_reference_is_fetched_once() -> Result<()> {
    let harness = Harness::new().await;
    Mock::given(method("GET"))
        .and(path("/api/2.5/tenders/a"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"data": document_json("a", "2017-01-02T00:00:00Z")})),
        )
        .expect(1)
        .mount(&harness.server)
        .await;

    harness.enqueue(ResourceItemReference::unresolved("a")).await;
    let mut worker = harness.worker(CancellationToken::new());

    assert_eq!(worker.run_once().await, Iteration::Processed);
    assert_eq!(worker.pending(), 1);
    Ok(())
}

#[tokio::test]
async fn stale_read_is_counted_and_retried() -> Result<()> {
    let harness = Harness::new().await;
    mount_document(&harness.server, "a", "2017-01-01T00:00:00Z").await;
    harness.enqueue(ResourceItemReference::new("a", date("2017-01-02T00:00:00Z"))).await;

    let mut worker = harness.worker(CancellationToken::new());
    assert_eq!(worker.run_once().await, Iteration::Processed);

    assert_eq!(worker.pending(), 0);
    assert_eq!(harness.stats().await.not_actual_docs_count, 1);

    let retried = harness.retry_queue.drain().await;
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].reference.date_modified, Some(date("2017-01-02T00:00:00Z")));
    assert_eq!(retried[0].retry.retries_count, 1);
    assert_eq!(retried[0].retry.timeout, Duration::from_secs(6));
    Ok(())
}

#[tokio::test]
async fn not_found_retries_and_renews_session() -> Result<()> {
    let harness = Harness::new().await;
    mount_status(&harness.server, "a", 404).await;
    harness.enqueue(ResourceItemReference::new("a", date("2017-01-02T00:00:00Z"))).await;

    let mut worker = harness.worker(CancellationToken::new());
    assert_eq!(worker.run_once().await, Iteration::Processed);

    let stats = harness.stats().await;
    assert_eq!(stats.not_found_count, 1);
    assert_eq!(harness.retry_queue.len(), 1);

    let client = harness.clients.acquire(Duration::from_secs(1)).await.expect("client renewed");
    assert!(!client.drop_cookies);
    assert_eq!(harness.stats().await.renewed_clients, 1);
    harness.clients.release(client).await;
    Ok(())
}

#[tokio::test]
async fn rate_limit_keeps_retry_metadata() -> Result<()> {
    let harness = Harness::new().await;
    mount_status(&harness.server, "a", 429).await;
    let retry = RetryMetadata { timeout: Duration::from_secs(12), retries_count: 2 };
    harness.enqueue_with(ResourceItemReference::new("a", date("2017-01-02T00:00:00Z")), retry).await;

    let mut worker = harness.worker(CancellationToken::new());
    assert_eq!(worker.run_once().await, Iteration::Processed);

    let retried = harness.retry_queue.drain().await;
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].retry, retry);

    let id = harness.clients.client_ids()[0];
    let health = harness.clients.health(id).expect("client registered");
    assert_eq!(health.request_interval, Duration::from_millis(100));
    Ok(())
}

#[tokio::test]
async fn reference_past_retry_ceiling_is_dropped() -> Result<()> {
    let harness =
        Harness::with(worker_config(), RetryPolicy { max_retries: 2, ..RetryPolicy::default() })
            .await;
    mount_status(&harness.server, "a", 500).await;
    let retry = RetryMetadata { timeout: Duration::from_secs(12), retries_count: 2 };
    harness.enqueue_with(ResourceItemReference::new("a", date("2017-01-02T00:00:00Z")), retry).await;

    let mut worker = harness.worker(CancellationToken::new());
    assert_eq!(worker.run_once().await, Iteration::Processed);

    let stats = harness.stats().await;
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.exceptions_count, 1);
    assert!(harness.retry_queue.is_empty());
    Ok(())
}

#[tokio::test]
async fn failed_bulk_save_retries_every_document() -> Result<()> {
    let harness =
        Harness::with(WorkerConfig { bulk_save_limit: 2, ..worker_config() }, RetryPolicy::default())
            .await;
    mount_document(&harness.server, "a", "2017-01-02T00:00:00Z").await;
    mount_document(&harness.server, "b", "2017-01-03T00:00:00Z").await;
    harness.storage.inject_save_error("couch unavailable").await;
    harness.enqueue(ResourceItemReference::new("a", date("2017-01-02T00:00:00Z"))).await;
    harness.enqueue(ResourceItemReference::new("b", date("2017-01-03T00:00:00Z"))).await;

    let token = CancellationToken::new();
    let handle = tokio::spawn(harness.worker(token.clone()).run());

    let storage = harness.storage.clone();
    let attempted = eventually(Duration::from_secs(5), || {
        let storage = storage.clone();
        async move { !storage.save_calls().await.is_empty() }
    })
    .await;
    assert!(attempted, "worker should attempt a bulk save");

    token.cancel();
    handle.await??;

    assert_eq!(harness.storage.len().await, 0);
    let mut retried: Vec<String> =
        harness.retry_queue.drain().await.into_iter().map(|entry| entry.reference.id).collect();
    retried.sort();
    assert_eq!(retried, vec!["a", "b"]);
    assert_eq!(harness.stats().await.exceptions_count, 1);
    Ok(())
}

#[tokio::test]
async fn rejected_document_is_retried_without_date() -> Result<()> {
    let harness =
        Harness::with(WorkerConfig { bulk_save_limit: 1, ..worker_config() }, RetryPolicy::default())
            .await;
    mount_document(&harness.server, "a", "2017-01-02T00:00:00Z").await;
    harness.storage.reject_next_save_of("a").await;
    harness.enqueue(ResourceItemReference::new("a", date("2017-01-02T00:00:00Z"))).await;

    let token = CancellationToken::new();
    let handle = tokio::spawn(harness.worker(token.clone()).run());

    let storage = harness.storage.clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            let storage = storage.clone();
            async move { !storage.save_calls().await.is_empty() }
        })
        .await
    );

    token.cancel();
    handle.await??;

    let retried = harness.retry_queue.drain().await;
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].reference, ResourceItemReference::unresolved("a"));
    Ok(())
}

#[tokio::test]
async fn worker_without_client_sleeps_and_stops_on_cancel() -> Result<()> {
    let harness = Harness::new().await;
    let held = harness.clients.acquire(Duration::from_secs(1)).await.expect("one client");

    let token = CancellationToken::new();
    let handle = tokio::spawn(harness.worker(token.clone()).run());
    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();

    tokio::time::timeout(Duration::from_secs(5), handle).await???;
    harness.clients.release(held).await;
    Ok(())
}
