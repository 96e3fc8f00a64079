//! Integration tests for the bridge orchestrator.
//!
//! The upstream host is unreachable in most of these tests, so workers never
//! obtain a client and the queues hold whatever the test puts in them. That
//! keeps the control-loop decisions observable.

mod common;

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use common::{date, document_json, eventually, mount_spore};
use edge_bridge::{
    client::ClientConfig,
    feed::{mock::StaticFeed, FeedItem},
    pool::PoolConfig,
    queue::Capacity,
    storage::mock::MockStorage,
    BridgeConfig, BridgeEngine, BridgeError,
};
use edge_core::{
    Clock, FeedDirection, QueueEntry, RealClock, ResourceDocument, ResourceItemReference,
    RetryMetadata,
};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

const IDLE: Duration = Duration::from_secs(3600);

fn config() -> BridgeConfig {
    BridgeConfig {
        workers_min: 1,
        workers_max: 3,
        retry_workers_min: 1,
        retry_workers_max: 2,
        resource_items_queue_size: Capacity::Bounded(10),
        bulk_query_limit: 10,
        bulk_query_interval: Duration::from_millis(50),
        feed_up_wait_sleep: IDLE,
        feed_error_sleep: Duration::from_millis(10),
        queue_timeout: Duration::from_millis(50),
        queues_controller_timeout: IDLE,
        watch_interval: IDLE,
        performance_watch_interval: IDLE,
        index_watch_interval: IDLE,
        shutdown_timeout: Duration::from_secs(5),
        worker: edge_bridge::worker::WorkerConfig {
            worker_sleep: Duration::from_millis(20),
            queue_timeout: Duration::from_millis(50),
            ..Default::default()
        },
        pool: PoolConfig {
            client: ClientConfig {
                host: "http://127.0.0.1:1".to_string(),
                timeout: Duration::from_secs(1),
                ..ClientConfig::default()
            },
            bridge_id: "engine-test".to_string(),
            max_clients: 3,
        },
        ..BridgeConfig::default()
    }
}

fn engine(storage: &MockStorage, feed: StaticFeed) -> BridgeEngine {
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    BridgeEngine::new(config(), Arc::new(storage.clone()), Arc::new(feed), clock)
}

fn entry(id: &str) -> QueueEntry {
    QueueEntry::new(
        ResourceItemReference::new(id, date("2017-01-02T00:00:00Z")),
        RetryMetadata::initial(Duration::from_secs(3)),
    )
}

#[tokio::test]
async fn start_spawns_worker_floors() -> Result<()> {
    let storage = MockStorage::new();
    let mut engine = engine(&storage, StaticFeed::new(Vec::new()));
    engine.start().await?;

    assert_eq!(engine.workers_len().await, 1);
    assert_eq!(engine.retry_workers_len().await, 1);
    assert!(engine.clients().is_empty());

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn controller_grows_on_backlog_and_shrinks_when_drained() -> Result<()> {
    let storage = MockStorage::new();
    let mut engine = engine(&storage, StaticFeed::new(Vec::new()));
    engine.start().await?;

    for i in 0..9 {
        engine.queue().push(entry(&format!("item-{i}")), Duration::from_secs(1)).await.ok();
    }

    engine.adjust_workers().await;
    engine.adjust_workers().await;
    engine.adjust_workers().await;
    assert_eq!(engine.workers_len().await, 3, "pool should stop at workers_max");

    while engine.queue().pop(Duration::ZERO).await.is_some() {}
    engine.adjust_workers().await;
    assert_eq!(engine.workers_len().await, 2);
    engine.adjust_workers().await;
    engine.adjust_workers().await;
    assert_eq!(engine.workers_len().await, 1, "pool should stop at workers_min");

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn worker_counts_readable_while_clients_top_up() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/api/2.5/spore"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;
    let mut config = config();
    config.pool.client.host = server.uri();

    let storage = MockStorage::new();
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let engine = BridgeEngine::new(
        config,
        Arc::new(storage.clone()),
        Arc::new(StaticFeed::new(Vec::new())),
        clock,
    );
    for i in 0..9 {
        engine.queue().push(entry(&format!("item-{i}")), Duration::from_secs(1)).await.ok();
    }

    let ((), observed) = tokio::join!(engine.adjust_workers(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::time::timeout(Duration::from_millis(200), engine.workers_len()).await
    });
    assert_eq!(observed?, 0, "worker lock must not be held while a client is created");
    assert_eq!(engine.workers_len().await, 1);
    assert_eq!(engine.clients().len(), 1);

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn index_rebuild_holds_pool_at_floor() -> Result<()> {
    let storage = MockStorage::new();
    let mut engine = engine(&storage, StaticFeed::new(Vec::new()));
    engine.start().await?;

    for i in 0..9 {
        engine.queue().push(entry(&format!("item-{i}")), Duration::from_secs(1)).await.ok();
        engine.retry_queue().push_after(entry(&format!("retry-{i}")), IDLE, Duration::ZERO).await.ok();
    }
    engine.adjust_workers().await;
    engine.adjust_workers().await;
    assert_eq!(engine.workers_len().await, 3);
    assert_eq!(engine.retry_workers_len().await, 2);

    storage.set_index_progress(42.0).await;
    assert_eq!(engine.check_index_lag().await?, 42.0);
    assert_eq!(engine.workers_len().await, 1, "one tick should reach the floor");
    assert_eq!(engine.retry_workers_len().await, 1, "retry pool also held at its floor");
    assert!(engine.is_throttled());

    engine.adjust_workers().await;
    assert_eq!(engine.workers_len().await, 1, "no growth while throttled");
    assert_eq!(engine.retry_workers_len().await, 1);

    storage.set_index_progress(100.0).await;
    engine.check_index_lag().await?;
    assert!(!engine.is_throttled());
    engine.adjust_workers().await;
    assert_eq!(engine.workers_len().await, 2);

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn performance_watcher_replaces_slow_client() -> Result<()> {
    let server = MockServer::start().await;
    mount_spore(&server).await;
    let mut config = config();
    config.pool.client.host = server.uri();
    config.pool.max_clients = 4;
    config.degraded_mean_multiplier = 2.0;

    let storage = MockStorage::new();
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let engine = BridgeEngine::new(
        config,
        Arc::new(storage.clone()),
        Arc::new(StaticFeed::new(Vec::new())),
        clock.clone(),
    );
    let clients = engine.clients().clone();
    assert_eq!(clients.top_up(4).await, 4);

    let mut handles = Vec::new();
    while let Some(handle) = clients.acquire(Duration::from_millis(50)).await {
        handles.push(handle);
    }
    assert_eq!(handles.len(), 4);

    let slow_id = handles[0].id;
    for (i, mut handle) in handles.into_iter().enumerate() {
        let duration = if i == 0 { Duration::from_secs(10) } else { Duration::from_millis(100) };
        handle.record_request(clock.now_system(), duration);
        clients.release(handle).await;
    }

    let report = engine.watch_performance().await;
    assert_eq!(report.degraded, vec![slow_id]);
    assert!(!clients.client_ids().contains(&slow_id), "slow client retired");
    assert_eq!(clients.len(), 4, "pool size restored by a fresh client");
    assert_eq!(engine.collect_stats(false).await.counters.replaced_clients, 1);

    let report = engine.watch_performance().await;
    assert!(report.degraded.is_empty(), "remaining clients are healthy");

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn feed_pump_enqueues_missing_and_stale_items() -> Result<()> {
    let storage = MockStorage::new();
    storage
        .insert(ResourceDocument::from_value(document_json("current", "2017-01-05T00:00:00Z"))?)
        .await;
    storage
        .insert(ResourceDocument::from_value(document_json("stale", "2017-01-01T00:00:00Z"))?)
        .await;

    let feed = StaticFeed::backward(vec![
        ResourceItemReference::new("missing", date("2017-01-02T00:00:00Z")),
        ResourceItemReference::new("current", date("2017-01-05T00:00:00Z")),
        ResourceItemReference::new("stale", date("2017-01-02T00:00:00Z")),
    ]);
    let mut engine = engine(&storage, feed);
    engine.start().await?;

    let queue = engine.queue().clone();
    assert!(eventually(Duration::from_secs(5), || {
        let queue = queue.clone();
        async move { queue.len() == 2 }
    })
    .await);

    let stats = engine.collect_stats(false).await;
    assert_eq!(stats.counters.add_to_resource_items_queue, 2);
    assert_eq!(stats.counters.skipped, 1);
    assert_eq!(stats.backward_info.resource_item_count, 3);

    let mut queued = Vec::new();
    while let Some(entry) = engine.queue().pop(Duration::ZERO).await {
        queued.push(entry.reference.id);
    }
    queued.sort();
    assert_eq!(queued, vec!["missing", "stale"]);

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn feed_errors_are_retried() -> Result<()> {
    let storage = MockStorage::new();
    let feed = StaticFeed::new(Vec::new());
    feed.push_error("connection reset");
    feed.push_batch(vec![FeedItem::new(
        ResourceItemReference::new("a", date("2017-01-02T00:00:00Z")),
        FeedDirection::Forward,
    )]);
    let mut engine = engine(&storage, feed);
    engine.start().await?;

    let queue = engine.queue().clone();
    assert!(eventually(Duration::from_secs(5), || {
        let queue = queue.clone();
        async move { queue.len() == 1 }
    })
    .await);
    assert!(!engine.cancellation_token().is_cancelled());

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn storage_failure_in_feed_pump_is_fatal() -> Result<()> {
    let storage = MockStorage::new();
    storage.inject_filter_error("couch unavailable").await;
    let feed =
        StaticFeed::backward(vec![ResourceItemReference::new("a", date("2017-01-02T00:00:00Z"))]);
    let mut engine = engine(&storage, feed);
    engine.start().await?;

    let failure = tokio::time::timeout(Duration::from_secs(5), engine.wait_for_failure()).await?;
    assert!(matches!(failure, Err(BridgeError::Storage { .. })));
    assert!(engine.cancellation_token().is_cancelled());
    assert!(engine.queue().is_empty());

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn stats_snapshot_resets_counters() -> Result<()> {
    let storage = MockStorage::new();
    let feed =
        StaticFeed::backward(vec![ResourceItemReference::new("a", date("2017-01-02T00:00:00Z"))]);
    let mut engine = engine(&storage, feed);
    engine.start().await?;

    let queue = engine.queue().clone();
    assert!(eventually(Duration::from_secs(5), || {
        let queue = queue.clone();
        async move { queue.len() == 1 }
    })
    .await);

    let snapshot = engine.collect_stats(true).await;
    assert_eq!(snapshot.counters.add_to_resource_items_queue, 1);
    assert_eq!(snapshot.resource_items_queue_size, 1);
    assert_eq!(snapshot.workers_count, 1);

    let json = serde_json::to_value(&snapshot)?;
    assert_eq!(json["add_to_resource_items_queue"], 1);
    assert_eq!(json["resource"], "tenders");
    assert!(json["forward_info"].is_object());

    let after = engine.collect_stats(false).await;
    assert_eq!(after.counters.add_to_resource_items_queue, 0);

    engine.shutdown().await?;
    Ok(())
}
