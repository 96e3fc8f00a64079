//! Shared fixtures for edge-bridge integration tests.

#![allow(dead_code)]

use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use edge_bridge::{
    client::ClientConfig,
    pool::{ApiClientPool, PoolConfig},
    queue::{Capacity, ResourceQueue, RetryQueue},
    retry::{RetryPolicy, RetryScheduler},
    stats::RuntimeStats,
    storage::mock::MockStorage,
    worker::{ResourceItemWorker, WorkerConfig, WorkerContext},
};
use edge_core::{
    parse_timestamp, Clock, QueueEntry, RealClock, ResourceItemReference, ResourceKind,
    RetryMetadata,
};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

/// Parses a test timestamp.
pub fn date(raw: &str) -> DateTime<Utc> {
    parse_timestamp(raw).expect("test timestamp should parse")
}

/// Minimal upstream document body.
pub fn document_json(id: &str, date_modified: &str) -> Value {
    json!({"id": id, "dateModified": date_modified, "title": format!("tender {id}")})
}

/// Mounts `GET /api/2.5/tenders/{id}` returning the document.
pub async fn mount_document(server: &MockServer, id: &str, date_modified: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/api/2.5/tenders/{id}")))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"data": document_json(id, date_modified)})),
        )
        .mount(server)
        .await;
}

/// Mounts `GET /api/2.5/tenders/{id}` answering with `status`.
pub async fn mount_status(server: &MockServer, id: &str, status: u16) {
    Mock::given(method("GET"))
        .and(path(format!("/api/2.5/tenders/{id}")))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

/// Mounts the session endpoint every new client calls.
pub async fn mount_spore(server: &MockServer) {
    Mock::given(method("HEAD"))
        .and(path("/api/2.5/spore"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

/// Polls `check` every 20ms until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}

/// Worker settings with short waits.
pub fn worker_config() -> WorkerConfig {
    WorkerConfig {
        worker_sleep: Duration::from_millis(10),
        queue_timeout: Duration::from_millis(200),
        ..WorkerConfig::default()
    }
}

/// Worker wiring against a wiremock upstream and in-memory storage.
pub struct Harness {
    pub server: MockServer,
    pub storage: MockStorage,
    pub clients: Arc<ApiClientPool>,
    pub queue: Arc<ResourceQueue>,
    pub retry_queue: Arc<RetryQueue>,
    pub stats: Arc<RwLock<RuntimeStats>>,
    pub clock: Arc<dyn Clock>,
    pub context: WorkerContext,
}

impl Harness {
    /// Starts an upstream with one established client.
    pub async fn new() -> Self {
        Self::with(worker_config(), RetryPolicy::default()).await
    }

    /// Starts an upstream with custom worker and retry settings.
    pub async fn with(worker: WorkerConfig, policy: RetryPolicy) -> Self {
        let server = MockServer::start().await;
        mount_spore(&server).await;

        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
        let stats = Arc::new(RwLock::new(RuntimeStats::default()));
        let storage = MockStorage::new();

        let clients = Arc::new(ApiClientPool::new(
            PoolConfig {
                client: ClientConfig { host: server.uri(), ..ClientConfig::default() },
                bridge_id: "test-bridge".to_string(),
                max_clients: 1,
            },
            clock.clone(),
            stats.clone(),
        ));
        clients.create_client().await.expect("client should start against mock upstream");

        let queue = Arc::new(ResourceQueue::new(Capacity::Bounded(100), clock.clone()));
        let retry_queue = Arc::new(RetryQueue::new(Capacity::Unbounded, clock.clone()));
        let retry = Arc::new(RetryScheduler::new(
            policy,
            retry_queue.clone(),
            stats.clone(),
            ResourceKind::Tenders,
        ));

        let context = WorkerContext {
            config: worker,
            storage: Arc::new(storage.clone()),
            clients: clients.clone(),
            retry,
            stats: stats.clone(),
            clock: clock.clone(),
        };

        Self { server, storage, clients, queue, retry_queue, stats, clock, context }
    }

    /// Worker pulling from the retrieval queue.
    pub fn worker(&self, token: CancellationToken) -> ResourceItemWorker {
        ResourceItemWorker::new(0, self.context.clone(), self.queue.clone(), token)
    }

    /// Enqueues a reference with fresh retry metadata.
    pub async fn enqueue(&self, reference: ResourceItemReference) {
        self.enqueue_with(reference, RetryMetadata::initial(Duration::from_secs(3))).await;
    }

    /// Enqueues a reference with explicit retry metadata.
    pub async fn enqueue_with(&self, reference: ResourceItemReference, retry: RetryMetadata) {
        self.queue
            .push(QueueEntry::new(reference, retry), Duration::from_secs(1))
            .await
            .expect("queue should have room");
    }

    /// Snapshot of the shared counters.
    pub async fn stats(&self) -> RuntimeStats {
        self.stats.read().await.clone()
    }
}
